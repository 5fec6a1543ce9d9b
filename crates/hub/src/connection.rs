//! Per-session connection management: read/write pumps, ping/pong,
//! invoke dispatch, send buffering.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use groupcast_protocol::constants::{
    MessageType, METHOD_DEREGISTER, METHOD_REGISTER, WS_ERR_CODE_BAD_REQUEST,
    WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
    DEFAULT_PROTOCOL_VERSION,
};
use groupcast_protocol::envelope::Message;
use groupcast_protocol::messages::{EventNotification, InvokeRequest, InvokeResult};

use crate::handler::Handler;
use crate::registry::ClientRegistry;

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Handle for sending messages to one session.
///
/// Cloneable and cheap — wraps an `mpsc::Sender`. Sends never block; a
/// saturated buffer drops the message and reports [`SendError`].
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Sends a protocol [`Message`] as JSON text.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Sends a typed result for the given request message.
    pub fn send_result<T: Serialize>(&self, req: &Message, value: &T) -> Result<(), SendError> {
        let value = serde_json::to_value(value).map_err(|_| SendError)?;
        let reply = req
            .reply(MessageType::Result, Some(&InvokeResult { value }))
            .map_err(|_| SendError)?;
        self.send_msg(reply)
    }

    /// Sends a push event.
    pub fn send_event(&self, notification: &EventNotification) -> Result<(), SendError> {
        let msg = Message::new(
            uuid::Uuid::new_v4().to_string(),
            MessageType::Event,
            Some(notification),
        )
        .map_err(|_| SendError)?;
        self.send_msg(msg)
    }

    pub(crate) fn send_ws(&self, msg: WsMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|_| SendError)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A session as the registry and handlers see it: its id plus the way to
/// talk back to it.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub sender: Sender,
}

/// Runs the read and write pumps for an accepted WebSocket session. The
/// pumps run as background tasks and stop when the connection ends or the
/// server cancel token is triggered; the transport-driven registry
/// removal fires when the read pump exits.
pub(crate) fn spawn_session<S, H>(
    ws_stream: S,
    session: SessionHandle,
    write_rx: mpsc::Receiver<WsMessage>,
    registry: Arc<ClientRegistry>,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let cancel = server_cancel.child_token();
    let (ws_sink, ws_read) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, write_rx, cancel.clone()));

    tokio::spawn(async move {
        handler.on_session_opened(session.clone()).await;
        read_pump(ws_read, &session, &registry, &handler, cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();

        // Transport disconnect notification: graceful close and timeout
        // land here alike.
        registry.handle_disconnect(&session.id);
        handler.on_session_closed(session.id.clone()).await;
        tracing::info!(session = %session.id, "session ended");
    });
}

/// Write pump: drains the send channel and emits keepalive pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches invocations.
async fn read_pump<S, H>(
    mut stream: S,
    session: &SessionHandle,
    registry: &Arc<ClientRegistry>,
    handler: &Arc<H>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!(session = %session.id, "pong timeout, closing session");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!(
                                        "message exceeds max size ({} > {})",
                                        text.len(),
                                        WS_MAX_MESSAGE_SIZE
                                    );
                                    continue;
                                }
                                dispatch_text(session, registry, handler, &text).await;
                            }
                            WsMessage::Binary(_) => {
                                tracing::warn!(session = %session.id, "unexpected binary frame");
                            }
                            WsMessage::Pong(_) => {
                                got_pong = true;
                                pong_deadline.reset();
                            }
                            WsMessage::Ping(data) => {
                                // Auto-respond to pings from the client.
                                let _ = session.sender.send_ws(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::info!(session = %session.id, "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(session = %session.id, "read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}

/// Dispatches a text (JSON) envelope.
async fn dispatch_text<H: Handler>(
    session: &SessionHandle,
    registry: &Arc<ClientRegistry>,
    handler: &Arc<H>,
    text: &str,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return;
        }
    };

    match msg.msg_type {
        MessageType::Invoke => handle_invoke(session, registry, handler, msg).await,
        MessageType::Ping => {
            if let Ok(reply) = msg.reply::<()>(MessageType::Pong, None) {
                let _ = session.sender.send_msg(reply);
            }
        }
        MessageType::Pong => {}
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = session.sender.send_error(
                &msg,
                WS_ERR_CODE_NOT_IMPLEMENTED,
                "unexpected message type",
            );
        }
    }
}

/// Routes an invoke to the built-in registry methods or the handler.
async fn handle_invoke<H: Handler>(
    session: &SessionHandle,
    registry: &Arc<ClientRegistry>,
    handler: &Arc<H>,
    msg: Message,
) {
    let req: InvokeRequest = match msg.parse_payload() {
        Ok(Some(r)) => r,
        _ => {
            let _ = session
                .sender
                .send_error(&msg, WS_ERR_CODE_BAD_REQUEST, "invalid invoke payload");
            return;
        }
    };

    match req.method.as_str() {
        METHOD_REGISTER => handle_register(session, registry, &msg, &req),
        METHOD_DEREGISTER => handle_deregister(session, registry, &msg, &req),
        _ => handler.on_invoke(session.clone(), msg, req).await,
    }
}

/// `register(name)` / `register(name, version)`.
fn handle_register(
    session: &SessionHandle,
    registry: &Arc<ClientRegistry>,
    msg: &Message,
    req: &InvokeRequest,
) {
    let Some(name) = req.args.first().and_then(|v| v.as_str()) else {
        let _ = session
            .sender
            .send_error(msg, WS_ERR_CODE_BAD_REQUEST, "register needs a client name");
        return;
    };

    let version = match req.args.get(1) {
        None => DEFAULT_PROTOCOL_VERSION,
        Some(v) => match v.as_i64() {
            Some(v) => v as i32,
            None => {
                let _ = session.sender.send_error(
                    msg,
                    WS_ERR_CODE_BAD_REQUEST,
                    "register version must be an integer",
                );
                return;
            }
        },
    };

    match registry.register(session, name, version) {
        Ok(session_id) => {
            let _ = session.sender.send_result(msg, &session_id);
        }
        Err(e) => {
            let _ = session
                .sender
                .send_error(msg, WS_ERR_CODE_BAD_REQUEST, &e.to_string());
        }
    }
}

/// `deregister(name)`.
fn handle_deregister(
    session: &SessionHandle,
    registry: &Arc<ClientRegistry>,
    msg: &Message,
    req: &InvokeRequest,
) {
    let Some(name) = req.args.first().and_then(|v| v.as_str()) else {
        let _ = session.sender.send_error(
            msg,
            WS_ERR_CODE_BAD_REQUEST,
            "deregister needs a client name",
        );
        return;
    };

    let session_id = registry.deregister(&session.id, name);
    let _ = session.sender.send_result(msg, &session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultHandler;
    use tokio_tungstenite::tungstenite::protocol::Message as TMessage;

    fn test_session(id: &str) -> (SessionHandle, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            SessionHandle {
                id: id.into(),
                sender: Sender::new(tx),
            },
            rx,
        )
    }

    fn recv_message(rx: &mut mpsc::Receiver<WsMessage>) -> Message {
        match rx.try_recv().expect("expected a reply") {
            TMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn sender_error_display() {
        assert!(SendError.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn invoke_register_replies_with_session_id() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");

        let req = InvokeRequest {
            method: METHOD_REGISTER.into(),
            args: vec![serde_json::json!("sensor-01")],
        };
        let msg = Message::new("r1", MessageType::Invoke, Some(&req)).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.id, "r1");
        assert_eq!(reply.msg_type, MessageType::Result);
        let result: InvokeResult = reply.parse_payload().unwrap().unwrap();
        assert_eq!(result.value, serde_json::json!("s1"));
        assert!(registry.contains_session("s1"));
    }

    #[tokio::test]
    async fn invoke_register_with_version() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");

        let req = InvokeRequest {
            method: METHOD_REGISTER.into(),
            args: vec![serde_json::json!("sensor-01"), serde_json::json!(3)],
        };
        let msg = Message::new("r1", MessageType::Invoke, Some(&req)).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let _ = recv_message(&mut rx);
        let record = registry.find_by_name("sensor-01", 3).unwrap();
        assert_eq!(record.protocol_version, 3);
    }

    #[tokio::test]
    async fn invoke_register_reserved_name_replies_error() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");

        let req = InvokeRequest {
            method: METHOD_REGISTER.into(),
            args: vec![serde_json::json!(
                groupcast_protocol::constants::ADMIN_GROUP_NAME
            )],
        };
        let msg = Message::new("r1", MessageType::Invoke, Some(&req)).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, WS_ERR_CODE_BAD_REQUEST);
        assert!(!registry.contains_session("s1"));
    }

    #[tokio::test]
    async fn invoke_register_without_name_replies_error() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");

        let req = InvokeRequest {
            method: METHOD_REGISTER.into(),
            args: vec![],
        };
        let msg = Message::new("r1", MessageType::Invoke, Some(&req)).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.msg_type, MessageType::Error);
    }

    #[tokio::test]
    async fn invoke_deregister_replies_with_session_id() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");
        registry.register(&session, "sensor-01", 0).unwrap();

        let req = InvokeRequest {
            method: METHOD_DEREGISTER.into(),
            args: vec![serde_json::json!("sensor-01")],
        };
        let msg = Message::new("d1", MessageType::Invoke, Some(&req)).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.msg_type, MessageType::Result);
        assert!(!registry.contains_session("s1"));
    }

    #[tokio::test]
    async fn unknown_method_goes_to_handler_default() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");

        let req = InvokeRequest {
            method: "doesNotExist".into(),
            args: vec![],
        };
        let msg = Message::new("u1", MessageType::Invoke, Some(&req)).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, WS_ERR_CODE_NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn envelope_ping_gets_pong() {
        let registry = Arc::new(ClientRegistry::new());
        let handler = Arc::new(DefaultHandler);
        let (session, mut rx) = test_session("s1");

        let msg = Message::new::<()>("p1", MessageType::Ping, None).unwrap();
        dispatch_text(&session, &registry, &handler, &serde_json::to_string(&msg).unwrap()).await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.id, "p1");
        assert_eq!(reply.msg_type, MessageType::Pong);
    }
}
