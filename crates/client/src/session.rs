//! WebSocket session handle.
//!
//! One `WsSession` is one logical transport session: it dials the hub with
//! the static auth header, runs read/write/ping pumps, correlates
//! request/response pairs by uuid and dispatches push events to subscribed
//! handlers.
//!
//! A session whose socket died keeps its handle in `Disconnected` state
//! and can be [`start`](WsSession::start)ed again in place — subscriptions
//! and callbacks survive such a restart. The session state is owned here
//! and observed lock-free by the connection manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use groupcast_protocol::constants::{
    AUTH_HEADER, MessageType, STATIC_AUTH_TOKEN, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use groupcast_protocol::envelope::Message;
use groupcast_protocol::messages::InvokeRequest;

use crate::pumps;
use crate::subscription::{EventHandler, Subscription, SubscriptionTable};
use crate::trace::{TraceConfig, TraceKind, TraceSink, TraceSlot, record_state_change, record_to};
use crate::types::{ClientError, SessionState, StateCallback, StateCell};

/// Send buffer capacity for outbound frames.
const SEND_BUFFER_SIZE: usize = 256;

/// Immutable session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full connect URL (endpoint joined with the hub path).
    pub url: String,
    /// Tunnel through the system proxy instead of dialing directly.
    pub use_system_proxy: bool,
}

/// Life-cycle callbacks observed by the connection manager. State changes
/// are wired separately through the state cell.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) on_slow: StdMutex<Option<Box<dyn Fn() + Send + Sync>>>,
    pub(crate) on_error: StdMutex<Option<Box<dyn Fn(ClientError) + Send + Sync>>>,
    pub(crate) on_closed: StdMutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Callbacks {
    pub(crate) fn set_slow(&self, cb: Box<dyn Fn() + Send + Sync>) {
        if let Ok(mut guard) = self.on_slow.lock() {
            *guard = Some(cb);
        }
    }

    pub(crate) fn set_error(&self, cb: Box<dyn Fn(ClientError) + Send + Sync>) {
        if let Ok(mut guard) = self.on_error.lock() {
            *guard = Some(cb);
        }
    }

    pub(crate) fn set_closed(&self, cb: Box<dyn Fn() + Send + Sync>) {
        if let Ok(mut guard) = self.on_closed.lock() {
            *guard = Some(cb);
        }
    }
}

/// A live socket attached to a session. Replaced on every (re)start; the
/// generation lets a dying pump recognise it has already been superseded.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) write_tx: mpsc::Sender<tungstenite::Message>,
    pub(crate) cancel: CancellationToken,
    pub(crate) generation: u64,
}

/// One logical transport session against the hub.
pub struct WsSession {
    config: SessionConfig,
    state: Arc<StateCell>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    subscriptions: Arc<SubscriptionTable>,
    callbacks: Arc<Callbacks>,
    link: Arc<StdRwLock<Option<Link>>>,
    trace: TraceSlot,
    last_ping: Arc<StdMutex<Option<Instant>>>,
    start_lock: Mutex<()>,
    generation: AtomicU64,
    was_connected: AtomicBool,
    cancel: CancellationToken,
}

impl WsSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: Arc::new(StateCell::new(SessionState::Disconnected)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: SubscriptionTable::new(),
            callbacks: Arc::new(Callbacks::default()),
            link: Arc::new(StdRwLock::new(None)),
            trace: TraceSlot::default(),
            last_ping: Arc::new(StdMutex::new(None)),
            start_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            was_connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Current transport-owned state. Lock-free read.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Dials the hub and brings the pumps up. Blocks the caller until the
    /// handshake completes or fails.
    ///
    /// Safe to call again on a handle whose socket died: the first start
    /// passes through `Connecting`, later restarts through `Reconnecting`.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _guard = self.start_lock.lock().await;
        if self.state.get() == SessionState::Connected {
            return Ok(());
        }

        let target = if self.was_connected.load(Ordering::Relaxed) {
            SessionState::Reconnecting
        } else {
            SessionState::Connecting
        };
        self.set_state(target);

        match self.dial().await {
            Ok(ws) => {
                self.attach(ws);
                self.was_connected.store(true, Ordering::Relaxed);
                self.set_state(SessionState::Connected);
                debug!(url = %self.config.url, "session started");
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Stops the current socket. The handle stays usable: `start` brings
    /// the session back up with the same subscriptions and callbacks.
    pub async fn close(&self) {
        let link = self.current_link();
        if let Some(link) = link {
            let _ = link
                .write_tx
                .send(tungstenite::Message::Close(None))
                .await;
            link.cancel.cancel();
        }
    }

    /// Invokes a remote method and waits for the correlated response.
    pub(crate) async fn send_request(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<Message, ClientError> {
        let link = self.current_link().ok_or(ClientError::Closed)?;

        let id = uuid::Uuid::new_v4().to_string();
        let payload = InvokeRequest {
            method: method.to_string(),
            args,
        };
        let msg = Message::new(&id, MessageType::Invoke, Some(&payload))?;
        let json = serde_json::to_string(&msg)?;
        record_to(&self.trace, TraceKind::Message, &format!(">> {json}"));

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if link
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(ClientError::Hub {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Registers a handler for a named push event.
    pub(crate) fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        self.subscriptions.add(event, handler)
    }

    /// Installs (or replaces) the wire-trace sink.
    pub(crate) fn apply_trace(&self, config: &TraceConfig) -> Result<(), ClientError> {
        let sink = TraceSink::open(config).map_err(|e| ClientError::Trace(e.to_string()))?;
        if let Ok(mut slot) = self.trace.write() {
            *slot = Some(Arc::new(sink));
        }
        Ok(())
    }

    pub(crate) fn set_state_callback(&self, cb: StateCallback) {
        self.state.set_callback(cb);
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    fn current_link(&self) -> Option<Link> {
        self.link.read().ok().and_then(|g| g.clone())
    }

    fn set_state(&self, new: SessionState) {
        if let Some((old, new)) = self.state.set(new) {
            record_state_change(&self.trace, old, new);
        }
    }

    async fn dial(&self) -> Result<WebSocketStream<TcpStream>, ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTH_HEADER, HeaderValue::from_static(STATIC_AUTH_TOKEN));

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let stream =
            crate::proxy::establish_stream(&request, self.config.use_system_proxy).await?;
        let (ws, _response) =
            tokio_tungstenite::client_async_with_config(request, stream, Some(ws_config)).await?;
        Ok(ws)
    }

    /// Spawns the pumps for a freshly dialed socket and installs the link.
    fn attach(&self, ws: WebSocketStream<TcpStream>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let link_cancel = self.cancel.child_token();
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(SEND_BUFFER_SIZE);
        let (sink, stream) = ws.split();

        tokio::spawn(pumps::write::write_pump(sink, write_rx, link_cancel.clone()));

        let ctx = pumps::read::ReadContext {
            pending: self.pending.clone(),
            subscriptions: self.subscriptions.clone(),
            callbacks: self.callbacks.clone(),
            state: self.state.clone(),
            trace: self.trace.clone(),
            link: self.link.clone(),
            write_tx: write_tx.clone(),
            cancel: link_cancel.clone(),
            last_ping: self.last_ping.clone(),
            generation,
        };
        tokio::spawn(pumps::read::read_pump(stream, ctx));

        tokio::spawn(pumps::ping::ping_pump(
            write_tx.clone(),
            self.last_ping.clone(),
            link_cancel.clone(),
        ));

        if let Ok(mut link) = self.link.write() {
            *link = Some(Link {
                write_tx,
                cancel: link_cancel,
                generation,
            });
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
