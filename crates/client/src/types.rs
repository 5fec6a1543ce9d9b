//! Public types for the client connection manager.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_tungstenite::tungstenite;

/// Errors from the client connection manager.
///
/// Variants carry rendered strings rather than source errors so the value
/// can be cloned into the `last_error` diagnostic slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("hub error {code}: {message}")]
    Hub { code: i32, message: String },

    #[error("trace sink error: {0}")]
    Trace(String),
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Transport-owned state of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// No live socket. A handle in this state can be restarted in place.
    Disconnected = 0,
    /// First dial in progress.
    Connecting = 1,
    /// Socket up, requests and events flowing.
    Connected = 2,
    /// In-place restart of an existing handle in progress.
    Reconnecting = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Reconnecting,
            _ => SessionState::Disconnected,
        }
    }
}

/// Payload-free life-cycle events for external consumers. Only the edge
/// matters, not the specific transport sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Maps a newly entered session state to the domain event it fires.
pub fn domain_event_for(state: SessionState) -> ConnectionEvent {
    match state {
        SessionState::Connected => ConnectionEvent::Connected,
        SessionState::Connecting | SessionState::Reconnecting | SessionState::Disconnected => {
            ConnectionEvent::Disconnected
        }
    }
}

pub(crate) type StateCallback = Box<dyn Fn(SessionState, SessionState) + Send + Sync>;

/// Atomic session-state cell. Reads are lock-free; transitions fire the
/// registered callback exactly once per actual change.
pub(crate) struct StateCell {
    state: AtomicU8,
    on_change: Mutex<Option<StateCallback>>,
}

impl StateCell {
    pub(crate) fn new(initial: SessionState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            on_change: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stores a new state. Returns `Some((old, new))` when the state
    /// actually changed, after invoking the change callback.
    pub(crate) fn set(&self, new: SessionState) -> Option<(SessionState, SessionState)> {
        let old = SessionState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        if old == new {
            return None;
        }
        if let Ok(guard) = self.on_change.lock()
            && let Some(cb) = guard.as_ref()
        {
            cb(old, new);
        }
        Some((old, new))
    }

    pub(crate) fn set_callback(&self, cb: StateCallback) {
        if let Ok(mut guard) = self.on_change.lock() {
            *guard = Some(cb);
        }
    }
}
