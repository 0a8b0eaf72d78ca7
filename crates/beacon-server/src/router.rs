use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use beacon_core::Envelope;

use crate::connection::{Connection, Delivery};

type Subscribers = Arc<Mutex<Vec<Arc<Connection>>>>;

/// Topic name to subscriber set.
///
/// Every topic has its own lock: subscribe, unsubscribe and publish on one
/// topic are serialized, while different topics proceed independently.
/// Empty topics are dropped under the map's shard lock, and subscribe pushes
/// while holding that same shard lock, so a subscriber can never land in a
/// set that has already been removed from the map.
#[derive(Default)]
pub struct TopicRouter {
    topics: DashMap<String, Subscribers>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already subscribed.
    pub fn subscribe(&self, conn: &Arc<Connection>, topic: &str) -> bool {
        let slot = self.topics.entry(topic.to_string()).or_default();
        let mut subs = slot.lock();
        if subs.iter().any(|c| c.id == conn.id) {
            return false;
        }
        subs.push(Arc::clone(conn));
        conn.add_subscription(topic);
        tracing::debug!(conn_id = %conn.id, topic, subscribers = subs.len(), "subscribed");
        true
    }

    pub fn unsubscribe(&self, conn: &Connection, topic: &str) -> bool {
        conn.remove_subscription(topic);
        let removed = self.detach(conn, topic);
        if removed {
            tracing::debug!(conn_id = %conn.id, topic, "unsubscribed");
        }
        removed
    }

    /// Drop the connection from every topic it joined.
    pub fn remove_connection(&self, conn: &Connection) {
        for topic in conn.take_subscriptions() {
            let _ = self.detach(conn, &topic);
        }
    }

    fn detach(&self, conn: &Connection, topic: &str) -> bool {
        let Some(slot) = self.topics.get(topic).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let removed = {
            let mut subs = slot.lock();
            let before = subs.len();
            subs.retain(|c| c.id != conn.id);
            subs.len() != before
        };
        let _ = self.topics.remove_if(topic, |_, slot| slot.lock().is_empty());
        removed
    }

    /// Fan an `event` envelope out to the topic's current subscribers.
    ///
    /// Returns how many connections accepted the frame. Closed connections
    /// met during fan-out are pruned; a topic with no subscribers is a no-op.
    pub fn publish(&self, topic: &str, data: Value) -> usize {
        let Some(slot) = self.topics.get(topic).map(|s| Arc::clone(s.value())) else {
            tracing::trace!(topic, "publish with no subscribers");
            return 0;
        };
        let message = match Envelope::event(topic, data).encode() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(topic, error = %e, "failed to encode event");
                return 0;
            }
        };

        let mut delivered = 0;
        let emptied = {
            let mut subs = slot.lock();
            subs.retain(|conn| match conn.try_deliver(message.clone()) {
                Delivery::Sent => {
                    delivered += 1;
                    true
                }
                Delivery::Full => true,
                Delivery::Closed => {
                    conn.remove_subscription(topic);
                    tracing::debug!(conn_id = %conn.id, topic, "pruned closed subscriber");
                    false
                }
            });
            subs.is_empty()
        };
        if emptied {
            let _ = self.topics.remove_if(topic, |_, slot| slot.lock().is_empty());
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |s| s.lock().len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::ids::ConnectionId;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn conn(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Connection::new(ConnectionId::new(), tx)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|raw| Envelope::decode(&raw).unwrap())
            .collect()
    }

    #[test]
    fn subscribe_is_idempotent() {
        let router = TopicRouter::new();
        let (a, _rx) = conn(8);
        assert!(router.subscribe(&a, "session.status"));
        assert!(!router.subscribe(&a, "session.status"));
        assert_eq!(router.subscriber_count("session.status"), 1);
        assert_eq!(a.subscriptions(), vec!["session.status"]);
    }

    #[test]
    fn publish_reaches_only_subscribers() {
        let router = TopicRouter::new();
        let (a, mut rx_a) = conn(8);
        let (b, mut rx_b) = conn(8);
        let (c, mut rx_c) = conn(8);
        router.subscribe(&a, "context.status");
        router.subscribe(&b, "context.status");
        router.subscribe(&c, "project.status");

        assert_eq!(router.publish("context.status", json!({"usedTokens": 5})), 2);

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic.as_deref(), Some("context.status"));
        assert_eq!(got[0].data, Some(json!({"usedTokens": 5})));
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let router = TopicRouter::new();
        assert_eq!(router.publish("reality.checks", json!([])), 0);
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery_and_drops_empty_topic() {
        let router = TopicRouter::new();
        let (a, mut rx) = conn(8);
        router.subscribe(&a, "t");
        assert!(router.unsubscribe(&a, "t"));
        assert!(!router.unsubscribe(&a, "t"));

        assert_eq!(router.publish("t", json!(1)), 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(router.topic_count(), 0);
    }

    #[test]
    fn closed_connections_are_pruned() {
        let router = TopicRouter::new();
        let (a, rx_a) = conn(8);
        let (b, mut rx_b) = conn(8);
        router.subscribe(&a, "t");
        router.subscribe(&b, "t");
        drop(rx_a);

        assert_eq!(router.publish("t", json!("x")), 1);
        assert_eq!(router.subscriber_count("t"), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(a.subscriptions().is_empty());
        assert_eq!(b.subscriptions(), vec!["t"]);
    }

    #[test]
    fn pruning_last_subscriber_drops_topic() {
        let router = TopicRouter::new();
        let (a, rx_a) = conn(8);
        router.subscribe(&a, "t");
        drop(rx_a);

        assert_eq!(router.publish("t", json!("x")), 0);
        assert_eq!(router.topic_count(), 0);
        assert!(a.subscriptions().is_empty());
    }

    #[test]
    fn full_queue_keeps_subscriber() {
        let router = TopicRouter::new();
        let (a, mut rx) = conn(1);
        router.subscribe(&a, "t");
        assert_eq!(router.publish("t", json!(1)), 1);
        assert_eq!(router.publish("t", json!(2)), 0);
        assert_eq!(router.subscriber_count("t"), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn remove_connection_leaves_every_topic() {
        let router = TopicRouter::new();
        let (a, _rx_a) = conn(8);
        let (b, _rx_b) = conn(8);
        for topic in ["x", "y", "z"] {
            router.subscribe(&a, topic);
        }
        router.subscribe(&b, "y");

        router.remove_connection(&a);
        assert_eq!(router.subscriber_count("x"), 0);
        assert_eq!(router.subscriber_count("y"), 1);
        assert_eq!(router.topic_count(), 1);
        assert!(a.subscriptions().is_empty());
    }

    #[test]
    fn unsubscribe_during_concurrent_publish() {
        let router = Arc::new(TopicRouter::new());
        let (stay, mut rx_stay) = conn(4096);
        let (leave, mut rx_leave) = conn(4096);
        router.subscribe(&stay, "t");
        router.subscribe(&leave, "t");

        let publisher = {
            let router = Arc::clone(&router);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    router.publish("t", json!(i));
                }
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(router.unsubscribe(&leave, "t"));
        router.publish("t", json!("after"));
        publisher.join().unwrap();

        let stayed = drain(&mut rx_stay);
        assert_eq!(stayed.len(), 1001);
        let left = drain(&mut rx_leave);
        assert!(left.len() <= 1000);
        assert!(left.iter().all(|e| e.data != Some(json!("after"))));
    }
}
