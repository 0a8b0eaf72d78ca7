use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use secrecy::SecretString;
use serde_json::Map;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use beacon_core::domain::ToolExecution;
use beacon_core::ids::ConnectionId;
use beacon_core::{emit_json, topics, Envelope, EnvelopeType, EventBus, EventChannel};
use beacon_engine::Collaborators;

use crate::auth::Authenticator;
use crate::connection::{self, Connection, ConnectionRegistry};
use crate::dispatcher::ToolDispatcher;
use crate::event_bridge::EventBridge;
use crate::router::TopicRouter;

const NOT_AUTHENTICATED: &str = "Not authenticated";
const AUTH_FAILED: &str = "Authentication failed";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub secret: SecretString,
    pub legacy_secrets: Vec<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8765,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            secret: SecretString::from("beacon-dev-secret".to_string()),
            legacy_secrets: Vec::new(),
        }
    }
}

/// Shared state handed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<TopicRouter>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat_interval: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, spawn every background task and return once the listener is up.
///
/// `bus` is the channel the collaborators were built over; the server
/// subscribes to it for push events and emits `tool:execution` entries on it.
pub async fn start(
    config: ServerConfig,
    collaborators: Collaborators,
    bus: EventBus,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue, config.heartbeat_timeout));
    let router = Arc::new(TopicRouter::new());

    let bridge = EventBridge::new(Arc::clone(&registry), Arc::clone(&router)).start(bus.subscribe());
    let cleanup = connection::start_cleanup_task(
        Arc::clone(&registry),
        Arc::clone(&router),
        config.heartbeat_interval,
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let processor = Arc::new(MessageProcessor {
        registry: Arc::clone(&registry),
        router: Arc::clone(&router),
        dispatcher: Arc::new(ToolDispatcher::new(collaborators)),
        auth: Authenticator::new(&config.secret, &config.legacy_secrets),
        events: Arc::new(bus),
    });
    let processor_handle = tokio::spawn(process_messages(msg_rx, processor));

    let app = build_router(AppState {
        registry,
        router,
        message_tx: msg_tx,
        heartbeat_interval: config.heartbeat_interval,
    });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "beacon server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        tasks: vec![server, bridge, processor_handle, cleanup],
    })
}

/// Keeps the background tasks alive; dropping it leaves them running,
/// `shutdown` aborts them.
pub struct ServerHandle {
    pub port: u16,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn, rx) = state.registry.register();
    tracing::info!(conn_id = %conn.id, "connection opened");

    connection::handle_ws_connection(
        socket,
        Arc::clone(&conn),
        rx,
        state.heartbeat_interval,
        state.message_tx,
    )
    .await;

    state.registry.unregister(&conn.id);
    state.router.remove_connection(&conn);
    tracing::info!(conn_id = %conn.id, "connection closed");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry.count(),
        "topics": state.router.topic_count(),
    }))
}

struct MessageProcessor {
    registry: Arc<ConnectionRegistry>,
    router: Arc<TopicRouter>,
    dispatcher: Arc<ToolDispatcher>,
    auth: Authenticator,
    events: Arc<dyn EventChannel>,
}

impl MessageProcessor {
    fn reply(&self, conn: &Connection, envelope: &Envelope) {
        match envelope.encode() {
            Ok(json) => {
                let _ = conn.try_deliver(json);
            }
            Err(e) => tracing::warn!(conn_id = %conn.id, error = %e, "failed to encode reply"),
        }
    }

    fn handle_frame(self: &Arc<Self>, conn: Arc<Connection>, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(conn_id = %conn.id, error = %e, kind = e.error_kind(), "dropping malformed frame");
                return;
            }
        };

        match envelope.kind {
            EnvelopeType::Authenticate => self.authenticate(&conn, envelope.auth.as_deref()),
            EnvelopeType::Ping => self.reply(&conn, &Envelope::pong()),
            EnvelopeType::Subscribe | EnvelopeType::Unsubscribe | EnvelopeType::Execute
                if !conn.is_authenticated() =>
            {
                tracing::debug!(conn_id = %conn.id, kind = %envelope.kind, "rejected before authentication");
                self.reply(&conn, &Envelope::error(envelope.request_id, NOT_AUTHENTICATED));
            }
            EnvelopeType::Subscribe => match envelope.require_topic() {
                Ok(topic) => {
                    let _ = self.router.subscribe(&conn, topic);
                }
                Err(e) => tracing::warn!(conn_id = %conn.id, error = %e, "dropping subscribe"),
            },
            EnvelopeType::Unsubscribe => match envelope.require_topic() {
                Ok(topic) => {
                    let _ = self.router.unsubscribe(&conn, topic);
                }
                Err(e) => tracing::warn!(conn_id = %conn.id, error = %e, "dropping unsubscribe"),
            },
            EnvelopeType::Execute => self.execute(conn, envelope),
            other => {
                tracing::debug!(conn_id = %conn.id, kind = %other, "ignoring server-bound envelope of unexpected type");
            }
        }
    }

    fn authenticate(&self, conn: &Connection, secret: Option<&str>) {
        if secret.is_some_and(|s| self.auth.verify(s)) {
            conn.mark_authenticated();
            tracing::info!(conn_id = %conn.id, "connection authenticated");
            self.reply(conn, &Envelope::auth_ok());
        } else {
            tracing::warn!(conn_id = %conn.id, "authentication failed");
            self.reply(conn, &Envelope::error(None, AUTH_FAILED));
        }
    }

    /// Each execute runs on its own task so a slow tool does not hold up
    /// later frames from the same or other connections.
    fn execute(self: &Arc<Self>, conn: Arc<Connection>, envelope: Envelope) {
        let Some(request_id) = envelope.request_id.clone() else {
            tracing::warn!(conn_id = %conn.id, "dropping execute without requestId");
            return;
        };
        let tool = match envelope.require_tool() {
            Ok(tool) => tool.to_string(),
            Err(e) => {
                self.reply(&conn, &Envelope::error(Some(request_id), e.to_string()));
                return;
            }
        };
        let params = envelope.params.unwrap_or_else(Map::new);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = this.dispatcher.execute(&tool, &params).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            tracing::info!(
                conn_id = %conn.id,
                request_id = %request_id,
                tool,
                success = outcome.success,
                duration_ms,
                "tool executed"
            );

            this.reply(&conn, &Envelope::result(request_id.clone(), &outcome));
            let entry = ToolExecution {
                tool,
                request_id: Some(request_id),
                success: outcome.success,
                duration_ms,
                timestamp: Utc::now().to_rfc3339(),
            };
            emit_json(this.events.as_ref(), topics::TOOL_EXECUTION, &entry);
        });
    }
}

async fn process_messages(mut rx: mpsc::Receiver<(ConnectionId, String)>, processor: Arc<MessageProcessor>) {
    while let Some((conn_id, raw)) = rx.recv().await {
        match processor.registry.get(&conn_id) {
            Some(conn) => processor.handle_frame(conn, &raw),
            None => tracing::debug!(conn_id = %conn_id, "frame from unregistered connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_engine::EngineConfig;
    use beacon_store::Database;

    fn collaborators(bus: &EventBus) -> Collaborators {
        Collaborators::build(
            Database::in_memory().unwrap(),
            Arc::new(bus.clone()),
            EngineConfig::default(),
        )
    }

    fn processor() -> (Arc<MessageProcessor>, EventBus) {
        let bus = EventBus::new(64);
        let p = Arc::new(MessageProcessor {
            registry: Arc::new(ConnectionRegistry::new(32, Duration::from_secs(90))),
            router: Arc::new(TopicRouter::new()),
            dispatcher: Arc::new(ToolDispatcher::new(collaborators(&bus))),
            auth: Authenticator::new(&SecretString::from("s".to_string()), &[]),
            events: Arc::new(bus.clone()),
        });
        (p, bus)
    }

    fn recv(rx: &mut mpsc::Receiver<String>) -> Envelope {
        Envelope::decode(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let bus = EventBus::new(64);
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, collaborators(&bus), bus).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn authenticate_success_and_failure() {
        let (p, _bus) = processor();
        let (conn, mut rx) = p.registry.register();

        p.handle_frame(Arc::clone(&conn), r#"{"type":"authenticate","auth":"wrong"}"#);
        let reply = recv(&mut rx);
        assert_eq!(reply.kind, EnvelopeType::Error);
        assert_eq!(reply.error.as_deref(), Some(AUTH_FAILED));
        assert!(!conn.is_authenticated());

        p.handle_frame(Arc::clone(&conn), r#"{"type":"authenticate","auth":"s"}"#);
        assert!(recv(&mut rx).is_auth_success());
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn subscribe_and_execute_rejected_before_auth() {
        let (p, _bus) = processor();
        let (conn, mut rx) = p.registry.register();

        p.handle_frame(Arc::clone(&conn), r#"{"type":"subscribe","topic":"session.status"}"#);
        assert_eq!(recv(&mut rx).error.as_deref(), Some(NOT_AUTHENTICATED));
        assert_eq!(p.router.subscriber_count("session.status"), 0);

        p.handle_frame(
            Arc::clone(&conn),
            r#"{"type":"execute","tool":"getActiveSession","params":{},"requestId":"r9"}"#,
        );
        let reply = recv(&mut rx);
        assert_eq!(reply.kind, EnvelopeType::Error);
        assert_eq!(reply.request_id.unwrap().as_str(), "r9");
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let (p, _bus) = processor();
        let (conn, mut rx) = p.registry.register();
        p.handle_frame(Arc::clone(&conn), "not json");
        p.handle_frame(Arc::clone(&conn), r#"{"type":"teleport"}"#);
        assert!(rx.try_recv().is_err());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (p, _bus) = processor();
        let (conn, mut rx) = p.registry.register();
        p.handle_frame(conn, r#"{"type":"ping"}"#);
        assert_eq!(recv(&mut rx).kind, EnvelopeType::Pong);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe() {
        let (p, _bus) = processor();
        let (conn, _rx) = p.registry.register();
        conn.mark_authenticated();

        p.handle_frame(Arc::clone(&conn), r#"{"type":"subscribe","topic":"context.status"}"#);
        assert_eq!(p.router.subscriber_count("context.status"), 1);
        p.handle_frame(Arc::clone(&conn), r#"{"type":"unsubscribe","topic":"context.status"}"#);
        assert_eq!(p.router.subscriber_count("context.status"), 0);
    }

    #[tokio::test]
    async fn execute_replies_and_logs_execution() {
        let (p, bus) = processor();
        let mut events = bus.subscribe();
        let (conn, mut rx) = p.registry.register();
        conn.mark_authenticated();

        p.handle_frame(
            Arc::clone(&conn),
            r#"{"type":"execute","tool":"getActiveSession","params":{},"requestId":"r1"}"#,
        );
        let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let reply = Envelope::decode(&raw).unwrap();
        assert_eq!(reply.kind, EnvelopeType::Result);
        assert_eq!(reply.data, Some(serde_json::json!({"success": true, "result": null})));

        let logged = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logged.topic, topics::TOOL_EXECUTION);
        assert_eq!(logged.data["tool"], "getActiveSession");
        assert_eq!(logged.data["requestId"], "r1");
    }
}
