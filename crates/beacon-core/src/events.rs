use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A domain event addressed to a topic, before it is wrapped in an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub topic: String,
    pub data: Value,
}

impl TopicEvent {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }
}

/// Sink that domain collaborators emit state changes through.
pub trait EventChannel: Send + Sync {
    fn emit(&self, event: TopicEvent);
}

/// Serialize `value` and emit it on `topic`. Serialization failures are logged and dropped.
pub fn emit_json<T: Serialize + ?Sized>(channel: &dyn EventChannel, topic: &str, value: &T) {
    match serde_json::to_value(value) {
        Ok(data) => channel.emit(TopicEvent::new(topic, data)),
        Err(e) => tracing::warn!(topic, error = %e, "failed to serialize event payload"),
    }
}

/// Broadcast-backed [`EventChannel`]. Emitting with no receivers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TopicEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventChannel for EventBus {
    fn emit(&self, event: TopicEvent) {
        let topic = event.topic.clone();
        if self.tx.send(event).is_err() {
            tracing::trace!(topic, "event emitted with no receivers");
        }
    }
}
