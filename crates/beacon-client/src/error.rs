use std::time::Duration;

use beacon_core::ids::RequestId;
use beacon_core::ProtocolError;

/// Why an outstanding request finished without a value.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("request {request_id} timed out after {after:?}")]
    Timeout { request_id: RequestId, after: Duration },

    #[error("server error: {0}")]
    Remote(String),

    /// The correlator went away before an answer arrived.
    #[error("request abandoned")]
    Abandoned,

    #[error("request id {0} is already outstanding")]
    Duplicate(RequestId),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error(transparent)]
    Request(#[from] RequestError),

    /// The tool ran and reported `{success:false}`.
    #[error("tool failed: {0}")]
    Tool(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(RequestError::Timeout { .. }))
    }
}
