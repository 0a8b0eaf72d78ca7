use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use beacon_core::ids::RequestId;
use beacon_core::{Envelope, EnvelopeType, ToolOutcome};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::correlator::{millis, RequestCorrelator};
use crate::error::{ClientError, RequestError};
use crate::listeners::{Listeners, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open { authenticated: bool },
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Reconnection gave up; no further attempts are scheduled.
    MaxAttemptsReached { attempts: u32 },
}

struct Running {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    correlator: RequestCorrelator,
    messages: Listeners<Envelope>,
    connection_events: Listeners<ConnectionEvent>,
    running: Mutex<Option<Running>>,
    generation: Mutex<u64>,
}

/// One logical connection to a beacon server.
///
/// Cloning shares the same connection. `connect` spawns a task that owns the
/// socket and every reconnect; `disconnect` cancels it and waits for it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let correlator = RequestCorrelator::new(config.request_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ConnectionState::Idle),
                outbound: Mutex::new(None),
                correlator,
                messages: Listeners::new(),
                connection_events: Listeners::new(),
                running: Mutex::new(None),
                generation: Mutex::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Open { authenticated: true }
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    /// Start the connection task unless one is already running.
    pub fn connect(&self) {
        let mut running = self.inner.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            tracing::debug!("connect called while already running");
            return;
        }

        let generation = {
            let mut g = self.inner.generation.lock();
            *g += 1;
            *g
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&self.inner), cancel.clone(), generation));
        *running = Some(Running {
            generation,
            cancel,
            task,
        });
    }

    /// Tear down the socket and cancel any scheduled reconnect.
    ///
    /// Outstanding requests are left alone; they still settle by response
    /// or by their own timeout.
    pub async fn disconnect(&self) {
        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                tracing::warn!(error = %e, "connection task ended abnormally");
            }
        }
        *self.inner.outbound.lock() = None;
        if self.state() != ConnectionState::Idle {
            self.inner.set_state(ConnectionState::Closed);
        }
        tracing::info!("disconnected");
    }

    /// Write an envelope if the socket is open; otherwise log and drop it.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.inner.send(envelope)
    }

    /// Run a tool on the server and wait for its result.
    pub async fn execute_tool(&self, tool: &str, params: Map<String, Value>) -> Result<Value, ClientError> {
        match self.state() {
            ConnectionState::Open { authenticated: true } => {}
            ConnectionState::Open { authenticated: false } => return Err(ClientError::NotAuthenticated),
            _ => return Err(ClientError::NotConnected),
        }

        let request_id = RequestId::new();
        let handle = self.inner.correlator.register(request_id.clone())?;
        if !self.send(&Envelope::execute(tool, params, request_id.clone())) {
            let _ = self.inner.correlator.discard(&request_id);
            return Err(ClientError::NotConnected);
        }

        let data = handle.wait().await?;
        let outcome = ToolOutcome::from_value(&data)?;
        if outcome.success {
            Ok(outcome.result.unwrap_or(Value::Null))
        } else {
            Err(ClientError::Tool(outcome.error.unwrap_or_default()))
        }
    }

    /// Every envelope that is not a correlated response, in arrival order.
    pub fn on_message(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> Subscription {
        self.inner.messages.add(callback)
    }

    pub fn on_connection_change(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.connection_events.add(callback)
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            tracing::debug!(state = ?next, "connection state changed");
            self.connection_events.emit(&ConnectionEvent::StateChanged(next));
        }
    }

    fn send(&self, envelope: &Envelope) -> bool {
        let Some(tx) = self.outbound.lock().clone() else {
            tracing::warn!(kind = %envelope.kind, "not connected, dropping outbound message");
            return false;
        };
        match envelope.encode() {
            Ok(json) => tx.send(json).is_ok(),
            Err(e) => {
                tracing::warn!(kind = %envelope.kind, error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        if envelope.is_correlated_response() {
            self.route_response(envelope);
            return;
        }

        if envelope.kind == EnvelopeType::Auth {
            if envelope.is_auth_success() {
                self.on_authenticated();
            } else {
                tracing::warn!("server rejected authentication");
            }
        } else if envelope.kind == EnvelopeType::Error {
            tracing::warn!(error = envelope.error.as_deref().unwrap_or(""), "server reported error");
        }
        self.messages.emit(&envelope);
    }

    fn route_response(&self, envelope: Envelope) {
        let Some(request_id) = envelope.request_id else { return };
        if envelope.kind == EnvelopeType::Result {
            let _ = self
                .correlator
                .resolve(&request_id, envelope.data.unwrap_or(Value::Null));
        } else {
            let message = envelope.error.unwrap_or_else(|| "unknown error".into());
            let _ = self.correlator.reject(&request_id, RequestError::Remote(message));
        }
    }

    fn on_authenticated(&self) {
        self.set_state(ConnectionState::Open { authenticated: true });
        tracing::info!(topics = self.config.topics.len(), "authenticated, subscribing");
        for topic in &self.config.topics {
            let _ = self.send(&Envelope::subscribe(topic.as_str()));
        }
    }

    /// Pump one open socket until it closes or `cancel` fires.
    async fn session(&self, socket: Socket, cancel: &CancellationToken) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Open { authenticated: false });
        let _ = self.send(&Envelope::authenticate(self.config.secret.expose_secret()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(out) = rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(out.into())).await {
                        tracing::warn!(error = %e, "socket write failed");
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket read failed");
                        break;
                    }
                },
            }
        }
        *self.outbound.lock() = None;
    }
}

async fn run(inner: Arc<Inner>, cancel: CancellationToken, generation: u64) {
    let mut backoff = Backoff::new(inner.config.backoff.clone());

    loop {
        inner.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            result = tokio_tungstenite::connect_async(inner.config.url.as_str()) => result,
            _ = cancel.cancelled() => break,
        };
        match attempt {
            Ok((socket, _)) => {
                tracing::info!(url = %inner.config.url, "connected");
                backoff.reset();
                inner.session(socket, &cancel).await;
            }
            Err(e) => tracing::warn!(url = %inner.config.url, error = %e, "connect failed"),
        }
        inner.set_state(ConnectionState::Closed);
        if cancel.is_cancelled() {
            break;
        }

        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.policy().max_attempts;
            tracing::error!(attempts, "max reconnect attempts reached");
            inner
                .connection_events
                .emit(&ConnectionEvent::MaxAttemptsReached { attempts });
            break;
        };
        tracing::info!(attempt = backoff.attempt(), delay_ms = millis(delay), "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    inner.set_state(ConnectionState::Closed);
    let mut running = inner.running.lock();
    if running.as_ref().is_some_and(|r| r.generation == generation) {
        *running = None;
    }
}
