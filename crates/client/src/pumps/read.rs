//! WebSocket read pump — dispatches incoming messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use groupcast_protocol::constants::{MessageType, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT, WS_SLOW_LINK};
use groupcast_protocol::envelope::Message;
use groupcast_protocol::messages::EventNotification;

use crate::session::{Callbacks, Link};
use crate::subscription::SubscriptionTable;
use crate::trace::{TraceKind, TraceSlot, record_to};
use crate::types::{ClientError, SessionState, StateCell};

/// Shared state handed to the read pump. Bundles the session internals the
/// pump touches so it isn't threaded through ten parameters.
pub(crate) struct ReadContext {
    pub(crate) pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    pub(crate) subscriptions: Arc<SubscriptionTable>,
    pub(crate) callbacks: Arc<Callbacks>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) trace: TraceSlot,
    pub(crate) link: Arc<StdRwLock<Option<Link>>>,
    pub(crate) write_tx: mpsc::Sender<tungstenite::Message>,
    pub(crate) cancel: CancellationToken,
    pub(crate) last_ping: Arc<StdMutex<Option<Instant>>>,
    pub(crate) generation: u64,
}

/// Reads messages from the WebSocket and dispatches them.
///
/// Uses a read deadline to detect dead connections: if nothing arrives
/// within [`WS_PONG_WAIT`] (no pong, no response, no event), the link is
/// considered dead and the pump exits, tearing the link down.
pub(crate) async fn read_pump<S>(mut read: S, ctx: ReadContext)
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, connection dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        // Any incoming message resets the deadline.
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text(&ctx, &text).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = ctx.write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                handle_pong(&ctx);
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary — not part of this protocol
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        notify_error(&ctx, e.into());
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    teardown(&ctx);
}

/// Handles a text message: routes responses to their pending request,
/// dispatches push events to subscribed handlers.
pub(crate) async fn handle_text(ctx: &ReadContext, text: &str) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    match msg.msg_type {
        MessageType::Event => {
            record_to(&ctx.trace, TraceKind::Event, &format!("<< {text}"));
            match msg.parse_payload::<EventNotification>() {
                Ok(Some(ev)) => {
                    ctx.subscriptions.dispatch(&ev.event, &ev.args);
                }
                Ok(None) => warn!(id = %msg.id, "event without payload"),
                Err(e) => warn!(id = %msg.id, "bad event payload: {e}"),
            }
        }
        _ => {
            record_to(&ctx.trace, TraceKind::Message, &format!("<< {text}"));
            let mut map = ctx.pending.lock().await;
            if let Some(tx) = map.remove(&msg.id) {
                let _ = tx.send(msg);
            } else {
                warn!(id = %msg.id, msg_type = ?msg.msg_type, "response with no pending request");
            }
        }
    }
}

/// Measures the pong round trip and fires the slow-link warning when the
/// link is degraded.
fn handle_pong(ctx: &ReadContext) {
    trace!("received pong");
    let sent = ctx.last_ping.lock().ok().and_then(|mut g| g.take());
    if let Some(sent) = sent {
        let rtt = sent.elapsed();
        if rtt > WS_SLOW_LINK {
            warn!(rtt_ms = rtt.as_millis() as u64, "slow link");
            if let Ok(guard) = ctx.callbacks.on_slow.lock()
                && let Some(cb) = guard.as_ref()
            {
                cb();
            }
        }
    }
}

fn notify_error(ctx: &ReadContext, err: ClientError) {
    if let Ok(guard) = ctx.callbacks.on_error.lock()
        && let Some(cb) = guard.as_ref()
    {
        cb(err);
    }
}

/// Tears the link down after the pump exits: clears the handle (if this
/// pump's link is still current), marks the session Disconnected and
/// fires the closed callback.
fn teardown(ctx: &ReadContext) {
    let was_current = match ctx.link.write() {
        Ok(mut link) => {
            if link.as_ref().is_some_and(|l| l.generation == ctx.generation) {
                *link = None;
                true
            } else {
                false
            }
        }
        Err(_) => false,
    };

    ctx.cancel.cancel();

    // A replaced link's pump must not disturb the new link's state.
    if !was_current {
        return;
    }

    if let Some((old, new)) = ctx.state.set(SessionState::Disconnected) {
        crate::trace::record_state_change(&ctx.trace, old, new);
    }

    if let Ok(guard) = ctx.callbacks.on_closed.lock()
        && let Some(cb) = guard.as_ref()
    {
        cb();
    }
}
