//! WebSocket hub for groupcast.
//!
//! Accepts many transient client sessions over WebSocket, dispatches
//! remote invocations (built-in `register`/`deregister` plus a [`Handler`]
//! extension seam) and maintains the [`ClientRegistry`]: the mapping from
//! transport session to logical client identity and group membership,
//! with membership-change notifications broadcast to the administrative
//! group.

mod connection;
mod groups;
mod handler;
mod registry;
mod server;

pub use connection::{SendError, Sender, SessionHandle};
pub use groups::Groups;
pub use handler::{DefaultHandler, Handler, HandlerFuture};
pub use registry::{ClientRecord, ClientRegistry, RegistryError};
pub use server::{HubConfig, HubServer};

/// Send buffer capacity per session.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the hub server.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
