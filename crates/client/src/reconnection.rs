//! Reconnect loop: polling retry of the connectivity check.
//!
//! The loop is polling, not event-driven, by design — it tolerates a
//! transport that fails to emit life-cycle events in some failure modes.
//! It is started idempotently (one slot, one loop) and carries a
//! cancellation token so an explicit close stops pending retries
//! deterministically.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::manager::{ConnInner, check_connection_inner};

/// Cancels a pending reconnect loop, if any.
pub(crate) fn cancel_reconnect(inner: &ConnInner) {
    if let Ok(mut slot) = inner.reconnect.lock()
        && let Some((_, token)) = slot.take()
    {
        token.cancel();
    }
}

/// Starts the reconnect loop unless one is already running or retries are
/// disabled (`retry_wait == 0`).
pub(crate) fn spawn_reconnect_loop(inner: Arc<ConnInner>) {
    if inner.retry_wait.load(Ordering::Relaxed) == 0 {
        return;
    }

    let (seq, token) = {
        let Ok(mut slot) = inner.reconnect.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let seq = inner.reconnect_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        *slot = Some((seq, token.clone()));
        (seq, token)
    };

    debug!("connection lost, starting reconnect loop");
    tokio::spawn(async move {
        loop {
            let wait = inner.retry_wait.load(Ordering::Relaxed);
            if wait == 0 {
                break;
            }
            trace!(wait_secs = wait, "reconnect loop waiting");
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("reconnect cancelled");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
            }
            if token.is_cancelled() {
                break;
            }
            if check_connection_inner(&inner).await {
                debug!("reconnect loop succeeded");
                break;
            }
        }

        // Clean up the slot if it's still ours. A canceller may already
        // have taken it and a newer loop may occupy it.
        if let Ok(mut slot) = inner.reconnect.lock()
            && slot.as_ref().is_some_and(|(s, _)| *s == seq)
        {
            *slot = None;
        }
    });
}
