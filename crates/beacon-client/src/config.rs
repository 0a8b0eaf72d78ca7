use std::time::Duration;

use secrecy::SecretString;

use beacon_core::topics;

use crate::backoff::BackoffPolicy;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    pub secret: SecretString,
    pub backoff: BackoffPolicy,
    /// Ceiling for every tool request.
    pub request_timeout: Duration,
    /// Subscribed after each successful authentication.
    pub topics: Vec<String>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, secret: SecretString) -> Self {
        Self {
            url: url.into(),
            secret,
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(30),
            topics: topics::DEFAULT_SUBSCRIPTIONS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
