//! Hub WebSocket server.
//!
//! Listens on a TCP port, validates the request path and static
//! credential on upgrade, and spawns a session (with a fresh session id)
//! per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use groupcast_protocol::constants::{AUTH_HEADER, STATIC_AUTH_TOKEN, WS_MAX_MESSAGE_SIZE};
use groupcast_protocol::endpoint::{AddressError, HubAddress};

use crate::HubError;
use crate::SEND_BUFFER_SIZE;
use crate::connection::{self, Sender, SessionHandle};
use crate::handler::Handler;
use crate::registry::ClientRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind (port 0 = OS-assigned).
    pub listen: SocketAddr,
    /// Request path clients must connect to.
    pub hub_path: String,
    /// Static credential expected in the auth header.
    pub auth_token: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 0).into(),
            hub_path: "/hubs/registry".into(),
            auth_token: STATIC_AUTH_TOKEN.into(),
        }
    }
}

impl HubConfig {
    /// Derives the server configuration from a [`HubAddress`].
    pub fn from_address(address: &HubAddress) -> Result<Self, AddressError> {
        Ok(Self {
            listen: address.bind_addr()?,
            hub_path: address.mount_path(),
            auth_token: STATIC_AUTH_TOKEN.into(),
        })
    }
}

/// The hub WebSocket server.
///
/// Owns nothing but the accept loop: the [`ClientRegistry`] is created by
/// the embedder and injected, so registry state is scoped to one hub
/// process and shared by handle.
pub struct HubServer<H: Handler> {
    config: HubConfig,
    registry: Arc<ClientRegistry>,
    handler: Arc<H>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> HubServer<H> {
    pub fn new(config: HubConfig, registry: Arc<ClientRegistry>, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// The injected registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Gracefully shuts down the server and all session pumps.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let listener = TcpListener::bind(self.config.listen).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(
            addr = %local_addr,
            path = %self.config.hub_path,
            "hub listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("hub shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles one TCP connection: validates the upgrade and spawns the
    /// session pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HubError> {
        let mount = normalize_path(&self.config.hub_path);
        let token = self.config.auth_token.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if normalize_path(req.uri().path()) != mount {
                tracing::warn!(path = %req.uri().path(), "rejecting unknown hub path");
                return Err(reject(StatusCode::NOT_FOUND));
            }
            let presented = req
                .headers()
                .get(AUTH_HEADER)
                .and_then(|v| v.to_str().ok());
            if presented != Some(token.as_str()) {
                tracing::warn!("rejecting connection without valid credential");
                return Err(reject(StatusCode::UNAUTHORIZED));
            }
            Ok(resp)
        };

        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%peer_addr, session = %session_id, "session established");

        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let session = SessionHandle {
            id: session_id,
            sender: Sender::new(tx),
        };

        connection::spawn_session(
            ws_stream,
            session,
            rx,
            self.registry.clone(),
            self.handler.clone(),
            self.cancel.clone(),
        );

        Ok(())
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}
