use std::sync::Arc;

use tokio::sync::broadcast;

use beacon_core::{topics, Envelope, TopicEvent};

use crate::connection::ConnectionRegistry;
use crate::router::TopicRouter;

/// Forwards collaborator events from the [`beacon_core::EventBus`] to sockets.
///
/// Out-of-band topics go to every authenticated connection; everything else
/// goes through the router to that topic's subscribers.
pub struct EventBridge {
    registry: Arc<ConnectionRegistry>,
    router: Arc<TopicRouter>,
}

impl EventBridge {
    pub fn new(registry: Arc<ConnectionRegistry>, router: Arc<TopicRouter>) -> Self {
        Self { registry, router }
    }

    /// Route one event and return how many connections accepted it.
    pub fn route(&self, event: TopicEvent) -> usize {
        if topics::is_out_of_band(&event.topic) {
            match Envelope::event(&event.topic, event.data).encode() {
                Ok(json) => self.registry.broadcast_authenticated(&json),
                Err(e) => {
                    tracing::warn!(topic = %event.topic, error = %e, "failed to encode event");
                    0
                }
            }
        } else {
            self.router.publish(&event.topic, event.data)
        }
    }

    pub fn start(self, mut rx: broadcast::Receiver<TopicEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let topic = event.topic.clone();
                        let delivered = self.route(event);
                        tracing::trace!(topic, delivered, "event routed");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}
