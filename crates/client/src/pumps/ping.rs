//! WebSocket ping pump — periodic keepalive pings.
//!
//! Records the send instant so the read pump can measure the pong round
//! trip for slow-link detection.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use groupcast_protocol::constants::WS_PING_PERIOD;

/// Sends periodic pings to keep the connection alive.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    last_ping: Arc<Mutex<Option<Instant>>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Ok(mut guard) = last_ping.lock() {
                    *guard = Some(Instant::now());
                }
                let ping = tungstenite::Message::Ping(vec![].into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_pump_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        let last_ping = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(async move {
            ping_pump(tx, last_ping, c).await;
        });

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }

    #[tokio::test]
    async fn ping_pump_records_send_instant() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let last_ping = Arc::new(Mutex::new(None));

        let c = cancel.clone();
        let lp = last_ping.clone();
        let handle = tokio::spawn(async move {
            ping_pump(tx, lp, c).await;
        });

        tokio::time::advance(WS_PING_PERIOD + std::time::Duration::from_millis(10)).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, tungstenite::Message::Ping(_)));
        assert!(last_ping.lock().unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
