use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beacon_core::ids::ConnectionId;

use crate::router::TopicRouter;

/// Outcome of handing one frame to a connection's send queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the frame was dropped but the connection is kept.
    Full,
    /// Writer gone; the connection should be pruned.
    Closed,
}

/// One accepted socket.
pub struct Connection {
    pub id: ConnectionId,
    authenticated: AtomicBool,
    connected: AtomicBool,
    last_pong: AtomicU64,
    subscriptions: Mutex<HashSet<String>>,
    tx: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            authenticated: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            subscriptions: Mutex::new(HashSet::new()),
            tx,
            closed: CancellationToken::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Never reverts.
    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    /// Also ends the socket task driving this connection, if any.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.closed.cancel();
    }

    /// Resolves once the connection has been marked disconnected.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    /// Topics this connection is subscribed to, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    pub(crate) fn add_subscription(&self, topic: &str) -> bool {
        self.subscriptions.lock().insert(topic.to_string())
    }

    pub(crate) fn remove_subscription(&self, topic: &str) -> bool {
        self.subscriptions.lock().remove(topic)
    }

    pub(crate) fn take_subscriptions(&self) -> HashSet<String> {
        std::mem::take(&mut *self.subscriptions.lock())
    }

    pub fn try_deliver(&self, message: String) -> Delivery {
        if !self.connected.load(Ordering::Relaxed) {
            return Delivery::Closed;
        }
        match self.tx.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(conn_id = %self.id, msg_len = msg.len(), "send queue full, dropping message");
                Delivery::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// All live connections, keyed by id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
    heartbeat_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, heartbeat_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            heartbeat_timeout,
        }
    }

    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(ConnectionId::new(), tx));
        self.connections.insert(conn.id.clone(), Arc::clone(&conn));
        (conn, rx)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        conn.mark_disconnected();
        Some(conn)
    }

    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        match self.get(id) {
            Some(conn) => conn.try_deliver(message) == Delivery::Sent,
            None => false,
        }
    }

    /// Deliver to every authenticated connection regardless of subscriptions.
    pub fn broadcast_authenticated(&self, message: &str) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| c.is_authenticated())
            .map(|c| Arc::clone(c.value()))
            .collect();
        targets
            .iter()
            .filter(|c| c.try_deliver(message.to_string()) == Delivery::Sent)
            .count()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Unregister every connection that missed its heartbeat window.
    pub fn reap_dead(&self) -> Vec<Arc<Connection>> {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| !c.is_alive(self.heartbeat_timeout) || !c.is_connected())
            .map(|c| c.id.clone())
            .collect();
        dead.iter().filter_map(|id| self.unregister(id)).collect()
    }
}

/// Drive one socket until either side closes or the connection is marked
/// disconnected (for example by the heartbeat reaper).
///
/// The writer forwards queued frames and sends a transport ping every
/// `heartbeat`; the reader forwards text frames to `on_message` and records
/// pongs. Cleanup of registry and router membership is left to the caller.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    heartbeat: Duration,
    on_message: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = Arc::clone(&conn);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_conn.id, "sent ping");
                }
                _ = writer_conn.closed() => {
                    tracing::debug!(conn_id = %writer_conn.id, "closing socket");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        writer_conn.mark_disconnected();
    });

    let reader_conn = Arc::clone(&conn);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_conn.id.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let writer_done = tokio::select! {
        _ = &mut writer => true,
        _ = &mut reader => false,
    };
    conn.mark_disconnected();
    reader.abort();
    if !writer_done && tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        tracing::debug!(conn_id = %conn.id, "writer did not finish closing in time");
    }
}

/// Periodically reap dead connections and drop them from every topic.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    router: Arc<TopicRouter>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let dead = registry.reap_dead();
            for conn in &dead {
                router.remove_connection(conn);
                tracing::info!(conn_id = %conn.id, "cleaned up dead connection");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(32, Duration::from_secs(90))
    }

    #[test]
    fn register_and_unregister() {
        let registry = registry();
        let (a, _rx_a) = registry.register();
        let (b, _rx_b) = registry.register();
        assert_ne!(a.id, b.id);
        assert_eq!(registry.count(), 2);

        let removed = registry.unregister(&a.id).unwrap();
        assert!(!removed.is_connected());
        assert_eq!(registry.count(), 1);
        assert!(registry.unregister(&a.id).is_none());
    }

    #[test]
    fn authentication_is_monotonic() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), tx);
        assert!(!conn.is_authenticated());
        conn.mark_authenticated();
        conn.mark_authenticated();
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn send_to_specific_connection() {
        let registry = registry();
        let (conn, mut rx) = registry.register();
        assert!(registry.send_to(&conn.id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(!registry.send_to(&ConnectionId::new(), "nobody".into()));
    }

    #[test]
    fn full_queue_drops_without_closing() {
        let registry = ConnectionRegistry::new(1, Duration::from_secs(90));
        let (conn, _rx) = registry.register();
        assert_eq!(conn.try_deliver("one".into()), Delivery::Sent);
        assert_eq!(conn.try_deliver("two".into()), Delivery::Full);
        assert!(conn.is_connected());
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let registry = registry();
        let (conn, rx) = registry.register();
        drop(rx);
        assert_eq!(conn.try_deliver("x".into()), Delivery::Closed);
        assert!(!conn.is_connected());
    }

    #[test]
    fn broadcast_reaches_only_authenticated() {
        let registry = registry();
        let (a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();
        a.mark_authenticated();

        assert_eq!(registry.broadcast_authenticated("evt"), 1);
        assert_eq!(rx_a.try_recv().unwrap(), "evt");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn reap_dead_removes_expired() {
        let registry = registry();
        let (stale, _rx1) = registry.register();
        let (_fresh, _rx2) = registry.register();
        stale.last_pong.store(0, Ordering::Relaxed);

        let reaped = registry.reap_dead();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, stale.id);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn reaping_signals_the_socket_task() {
        let registry = registry();
        let (stale, _rx) = registry.register();
        stale.last_pong.store(0, Ordering::Relaxed);

        let _ = registry.reap_dead();
        tokio::time::timeout(Duration::from_millis(100), stale.closed())
            .await
            .unwrap();
    }

    #[test]
    fn subscriptions_tracked_per_connection() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionId::new(), tx);
        assert!(conn.add_subscription("b"));
        assert!(conn.add_subscription("a"));
        assert!(!conn.add_subscription("a"));
        assert_eq!(conn.subscriptions(), vec!["a", "b"]);

        assert!(conn.remove_subscription("a"));
        assert_eq!(conn.take_subscriptions().len(), 1);
        assert!(conn.subscriptions().is_empty());
    }
}
