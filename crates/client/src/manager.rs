//! Connection manager owning one logical hub connection.
//!
//! Performs the initial connect, detects loss, runs the self-limiting
//! reconnect loop, guards every outward call with a connectivity check and
//! surfaces payload-free Connected/Disconnected life-cycle events.
//!
//! Failure contract: `invoke` never raises — a failed call records
//! `last_error` and yields the result type's default value, so callers
//! must consult [`last_error`](ConnectionManager::last_error) or
//! [`is_connected`](ConnectionManager::is_connected) to detect degraded
//! operation. The `strict-invoke` feature adds `try_invoke` for callers
//! that need the distinction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use groupcast_protocol::endpoint::HubAddress;
use groupcast_protocol::messages::InvokeResult;

use crate::reconnection::{cancel_reconnect, spawn_reconnect_loop};
use crate::session::{SessionConfig, WsSession};
use crate::subscription::Subscription;
use crate::trace::{TraceConfig, TraceLevel, sanitize_trace_path};
use crate::types::{ClientError, ConnectionEvent, SessionState, domain_event_for};

/// Default seconds between reconnect attempts.
pub const DEFAULT_RETRY_WAIT_SECS: u64 = 60;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shared state behind the manager. Kept in one `Arc` so the reconnect
/// loop and session callbacks reference the same fields as the public
/// handle.
pub(crate) struct ConnInner {
    pub(crate) address: HubAddress,
    /// The active handle. Mutated only under `connect_guard`; read
    /// through short read-lock guards everywhere else.
    pub(crate) session: StdRwLock<Option<Arc<WsSession>>>,
    /// Serializes create/replace/restart of the handle.
    pub(crate) connect_guard: Mutex<()>,
    pub(crate) last_error: StdMutex<Option<ClientError>>,
    /// Seconds between retries; 0 disables the reconnect loop.
    pub(crate) retry_wait: AtomicU64,
    /// Slot for the single active reconnect loop: (sequence, cancel).
    pub(crate) reconnect: StdMutex<Option<(u64, CancellationToken)>>,
    pub(crate) reconnect_seq: AtomicU64,
    /// Set on explicit close so the closed callback skips reconnecting.
    pub(crate) manual_disconnect: AtomicBool,
    pub(crate) events_tx: mpsc::Sender<ConnectionEvent>,
    pub(crate) events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    pub(crate) trace: StdMutex<Option<TraceConfig>>,
}

impl ConnInner {
    pub(crate) fn record_error(&self, err: ClientError) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(err);
        }
    }

    pub(crate) fn current_session(&self) -> Option<Arc<WsSession>> {
        self.session.read().ok().and_then(|g| g.clone())
    }
}

/// Client-side connection manager. One instance per logical connection,
/// created at startup and living for the process lifetime. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

impl ConnectionManager {
    pub fn new(address: HubAddress) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ConnInner {
                address,
                session: StdRwLock::new(None),
                connect_guard: Mutex::new(()),
                last_error: StdMutex::new(None),
                retry_wait: AtomicU64::new(DEFAULT_RETRY_WAIT_SECS),
                reconnect: StdMutex::new(None),
                reconnect_seq: AtomicU64::new(0),
                manual_disconnect: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                trace: StdMutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &HubAddress {
        &self.inner.address
    }

    /// Establishes a new transport session. Returns `false` on failure,
    /// in which case `last_error` holds the cause and the reconnect loop
    /// has been scheduled (unless retries are disabled).
    pub async fn connect(&self) -> bool {
        connect_inner(&self.inner).await
    }

    /// `true` iff a handle exists and its observed state is Connected.
    /// Pure read, no side effects.
    pub fn is_connected(&self) -> bool {
        self.inner
            .current_session()
            .is_some_and(|s| s.state() == SessionState::Connected)
    }

    /// The guard invoked before every outward call: reconnects or restarts
    /// as needed and reports whether the connection is usable.
    pub async fn check_connection_state(&self) -> bool {
        check_connection_inner(&self.inner).await
    }

    /// Calls a named remote method. On any failure the result type's
    /// default value is returned and `last_error` records the cause —
    /// callers cannot distinguish a failed call from one that legitimately
    /// returned the default.
    pub async fn invoke<T>(&self, method: &str, args: Vec<Value>) -> T
    where
        T: DeserializeOwned + Default,
    {
        match invoke_inner(&self.inner, method, args).await {
            Ok(value) => value,
            // The connectivity check already recorded the underlying cause.
            Err(ClientError::NotConnected) => T::default(),
            Err(e) => {
                self.inner.record_error(e);
                T::default()
            }
        }
    }

    /// Strict variant of [`invoke`](Self::invoke) that surfaces failures.
    #[cfg(feature = "strict-invoke")]
    pub async fn try_invoke<T>(&self, method: &str, args: Vec<Value>) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let result = invoke_inner(&self.inner, method, args).await;
        if let Err(e) = &result {
            self.inner.record_error(e.clone());
        }
        result
    }

    /// Registers a handler for a named push event. Returns `None` when the
    /// connection cannot be established. The handler receives the event's
    /// positional arguments (up to seven).
    pub async fn subscribe<F>(&self, event: &str, handler: F) -> Option<Subscription>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        if !check_connection_inner(&self.inner).await {
            return None;
        }
        let session = self.inner.current_session()?;
        Some(session.subscribe(event, Box::new(handler)))
    }

    /// Stops the active session and cancels any pending reconnect loop, so
    /// an intentional shutdown cannot be resurrected by a stale retry.
    pub async fn close(&self) {
        info!("closing connection");
        self.inner.manual_disconnect.store(true, Ordering::Relaxed);
        cancel_reconnect(&self.inner);
        if let Some(session) = self.inner.current_session() {
            session.close().await;
        }
    }

    /// Stores trace configuration and applies it to the active session if
    /// one exists. The path is sanitized (`'#'` becomes `'-'`) first.
    pub fn set_trace(&self, level: TraceLevel, path: &str) {
        let config = TraceConfig {
            level,
            path: sanitize_trace_path(path),
        };
        if let Ok(mut slot) = self.inner.trace.lock() {
            *slot = Some(config.clone());
        }
        if let Some(session) = self.inner.current_session()
            && let Err(e) = session.apply_trace(&config)
        {
            warn!("failed to apply trace configuration: {e}");
            self.inner.record_error(e);
        }
    }

    /// Most recent failure, for diagnostics. Overwritten on every failed
    /// operation.
    pub fn last_error(&self) -> Option<ClientError> {
        self.inner.last_error.lock().ok().and_then(|g| g.clone())
    }

    /// Sets the seconds between reconnect attempts. `0` disables the
    /// reconnect loop entirely.
    pub fn set_retry_wait(&self, secs: u64) {
        self.inner.retry_wait.store(secs, Ordering::Relaxed);
    }

    pub fn retry_wait(&self) -> u64 {
        self.inner.retry_wait.load(Ordering::Relaxed)
    }

    /// Takes the life-cycle event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.inner.events_rx.lock().await.take()
    }
}

/// Full connect: replaces the handle with a freshly configured session.
pub(crate) async fn connect_inner(inner: &Arc<ConnInner>) -> bool {
    let _guard = inner.connect_guard.lock().await;
    connect_locked(inner).await
}

/// Connect body. Caller must hold `connect_guard`.
async fn connect_locked(inner: &Arc<ConnInner>) -> bool {
    info!(
        url = %inner.address.connect_url(),
        surface = inner.address.surface_name(),
        "connecting"
    );
    inner.manual_disconnect.store(false, Ordering::Relaxed);
    if let Ok(mut slot) = inner.last_error.lock() {
        *slot = None;
    }

    // Drop the prior handle: stops its pumps and closes its trace sink.
    let old = inner.session.write().ok().and_then(|mut g| g.take());
    if let Some(old) = old {
        old.close().await;
    }

    let session = Arc::new(WsSession::new(SessionConfig {
        url: inner.address.connect_url(),
        use_system_proxy: inner.address.use_system_proxy,
    }));
    wire_callbacks(inner, &session);

    let trace_config = inner.trace.lock().ok().and_then(|g| g.clone());
    if let Some(config) = trace_config
        && let Err(e) = session.apply_trace(&config)
    {
        warn!("failed to apply trace configuration: {e}");
    }

    match session.start().await {
        Ok(()) => {
            if let Ok(mut slot) = inner.session.write() {
                *slot = Some(session);
            }
            true
        }
        Err(e) => {
            error!("connect failed: {e}");
            inner.record_error(e);
            spawn_reconnect_loop(inner.clone());
            false
        }
    }
}

/// Connectivity guard: reconnect, restart in place, or confirm Connected.
pub(crate) async fn check_connection_inner(inner: &Arc<ConnInner>) -> bool {
    // Fast path: no lock while the connection is healthy, so concurrent
    // invokers only serialize during an actual reconnect attempt.
    if inner
        .current_session()
        .is_some_and(|s| s.state() == SessionState::Connected)
    {
        return true;
    }

    let _guard = inner.connect_guard.lock().await;

    // Re-evaluate under the guard: a concurrent caller may have already
    // re-established the connection while we waited.
    match inner.current_session() {
        Some(session) if session.state() == SessionState::Connected => true,
        Some(session) if session.state() == SessionState::Disconnected => {
            // Transient loss with the handle retained: lightweight restart
            // of the existing session instead of full re-creation.
            debug!("session disconnected, restarting in place");
            match session.start().await {
                Ok(()) => true,
                Err(e) => {
                    error!("restart failed: {e}");
                    inner.record_error(e);
                    false
                }
            }
        }
        // No handle, or one stuck mid-handshake: full re-creation.
        _ => connect_locked(inner).await,
    }
}

async fn invoke_inner<T: DeserializeOwned>(
    inner: &Arc<ConnInner>,
    method: &str,
    args: Vec<Value>,
) -> Result<T, ClientError> {
    if !check_connection_inner(inner).await {
        return Err(ClientError::NotConnected);
    }
    let session = inner.current_session().ok_or(ClientError::NotConnected)?;

    trace!(method, ?args, "invoke");
    let resp = session.send_request(method, args).await?;
    let result: InvokeResult = resp
        .parse_payload()?
        .ok_or_else(|| ClientError::Protocol("empty result payload".into()))?;
    trace!(method, value = %result.value, "invoked");
    Ok(serde_json::from_value(result.value)?)
}

/// Wires the session's life-cycle callbacks into the shared state.
fn wire_callbacks(inner: &Arc<ConnInner>, session: &Arc<WsSession>) {
    // State transitions drive the payload-free domain events: entering
    // Connected fires Connected, entering any other state fires
    // Disconnected. Only the edge matters.
    let events_tx = inner.events_tx.clone();
    session.set_state_callback(Box::new(move |old, new| {
        debug!(?old, ?new, "session state changed");
        if let Err(e) = events_tx.try_send(domain_event_for(new)) {
            trace!("dropping domain event: {e}");
        }
    }));

    let err_inner = Arc::downgrade(inner);
    session.callbacks().set_error(Box::new(move |err| {
        error!("session error: {err}");
        if let Some(inner) = err_inner.upgrade() {
            inner.record_error(err);
        }
    }));

    session.callbacks().set_slow(Box::new(|| {
        warn!("slow connection");
    }));

    let closed_inner = Arc::downgrade(inner);
    let closed_session = Arc::downgrade(session);
    session.callbacks().set_closed(Box::new(move || {
        let Some(inner) = closed_inner.upgrade() else {
            return;
        };
        // A handle that has already been replaced must not trigger a
        // reconnect on behalf of the new one.
        if let Some(current) = inner.current_session()
            && let Some(closed) = closed_session.upgrade()
            && !Arc::ptr_eq(&current, &closed)
        {
            return;
        }
        if inner.manual_disconnect.load(Ordering::Relaxed) {
            debug!("session closed after explicit close");
            return;
        }
        warn!("connection closed");
        spawn_reconnect_loop(inner);
    }));
}
