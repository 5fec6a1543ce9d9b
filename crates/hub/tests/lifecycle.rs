//! End-to-end lifecycle: a real client manager against a real hub.
//!
//! A watcher client joins the administrative group through a custom
//! handler method and observes the membership notifications that
//! register/deregister/transport-drop produce.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use groupcast_client::ConnectionManager;
use groupcast_hub::{
    ClientRegistry, Handler, HandlerFuture, HubConfig, HubServer, SessionHandle,
};
use groupcast_protocol::constants::{ADMIN_GROUP_NAME, WS_ERR_CODE_NOT_IMPLEMENTED};
use groupcast_protocol::endpoint::HubAddress;
use groupcast_protocol::envelope::Message;
use groupcast_protocol::messages::InvokeRequest;

/// Extension handler: `watch` places the calling session in the
/// administrative group.
struct WatchHandler {
    registry: Arc<ClientRegistry>,
}

impl Handler for WatchHandler {
    fn on_invoke(
        &self,
        session: SessionHandle,
        msg: Message,
        req: InvokeRequest,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            if req.method == "watch" {
                self.registry.add_to_group(ADMIN_GROUP_NAME, &session);
                let _ = session.sender.send_result(&msg, &session.id);
            } else {
                let _ = session.sender.send_error(
                    &msg,
                    WS_ERR_CODE_NOT_IMPLEMENTED,
                    "unknown method",
                );
            }
        })
    }
}

async fn start_hub() -> (Arc<HubServer<WatchHandler>>, Arc<ClientRegistry>, u16) {
    let registry = Arc::new(ClientRegistry::new());
    let handler = WatchHandler {
        registry: registry.clone(),
    };
    let server = HubServer::new(HubConfig::default(), registry.clone(), handler);

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    for _ in 0..100 {
        if server.port().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let port = server.port().await;
    assert!(port > 0);
    (server, registry, port)
}

fn hub_address(port: u16) -> HubAddress {
    HubAddress::new(format!("ws://127.0.0.1:{port}"), "/hubs/registry", false)
}

type SeenEvents = Arc<Mutex<Vec<(String, String)>>>;

/// Connects a watcher client, joins the admin group and subscribes to the
/// membership events. Returns the manager, the captured events and the
/// live subscriptions (dropping them would unsubscribe).
async fn connected_watcher(
    port: u16,
) -> (
    ConnectionManager,
    SeenEvents,
    Vec<groupcast_client::Subscription>,
) {
    let watcher = ConnectionManager::new(hub_address(port));
    let watcher_id: String = watcher.invoke("watch", vec![]).await;
    assert!(!watcher_id.is_empty(), "watch should return the session id");

    let seen: SeenEvents = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for event in ["clientConnected", "clientDisconnected"] {
        let seen = seen.clone();
        let name = event.to_string();
        let sub = watcher
            .subscribe(event, move |args| {
                let who = args
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push((name.clone(), who));
            })
            .await
            .expect("watcher should be connected");
        subs.push(sub);
    }

    (watcher, seen, subs)
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn register_notifies_admin_and_drop_cleans_up() {
    let (server, registry, port) = start_hub().await;
    let (watcher, seen, _subs) = connected_watcher(port).await;

    let client = ConnectionManager::new(hub_address(port));
    let session_id: String = client
        .invoke("register", vec![json!("sensor-01")])
        .await;
    assert!(!session_id.is_empty());
    assert!(registry.contains_session(&session_id));
    assert_eq!(registry.group_members("sensor-01"), vec![session_id.clone()]);

    {
        let seen = seen.clone();
        wait_until(
            move || {
                seen.lock()
                    .unwrap()
                    .contains(&("clientConnected".into(), "sensor-01".into()))
            },
            "clientConnected notification",
        )
        .await;
    }

    // Transport drop: the hub reconciles the registry and notifies with
    // the original name.
    client.close().await;

    {
        let registry = registry.clone();
        let session_id = session_id.clone();
        wait_until(
            move || !registry.contains_session(&session_id),
            "registry cleanup after disconnect",
        )
        .await;
    }
    assert!(registry.group_members("sensor-01").is_empty());

    {
        let seen = seen.clone();
        wait_until(
            move || {
                seen.lock()
                    .unwrap()
                    .contains(&("clientDisconnected".into(), "sensor-01".into()))
            },
            "clientDisconnected notification",
        )
        .await;
    }

    watcher.close().await;
    server.shutdown();
}

#[tokio::test]
async fn deregister_normalizes_and_always_notifies() {
    let (server, registry, port) = start_hub().await;
    let (watcher, seen, _subs) = connected_watcher(port).await;

    let client = ConnectionManager::new(hub_address(port));
    let session_id: String = client
        .invoke("register", vec![json!("sensor-01")])
        .await;
    assert!(registry.contains_session(&session_id));

    // Suffixed variant collapses to the registered root name.
    let returned: String = client
        .invoke("deregister", vec![json!("sensor-01_extra")])
        .await;
    assert_eq!(returned, session_id);
    assert!(!registry.contains_session(&session_id));

    {
        let seen = seen.clone();
        wait_until(
            move || {
                seen.lock()
                    .unwrap()
                    .contains(&("clientDisconnected".into(), "sensor-01".into()))
            },
            "normalized clientDisconnected notification",
        )
        .await;
    }

    // Deregistering again finds no record but still notifies — the
    // deliberate over-notification asymmetry.
    let _: String = client
        .invoke("deregister", vec![json!("sensor-01_extra")])
        .await;
    {
        let seen = seen.clone();
        wait_until(
            move || {
                seen.lock()
                    .unwrap()
                    .iter()
                    .filter(|(ev, who)| ev == "clientDisconnected" && who == "sensor-01")
                    .count()
                    >= 2
            },
            "second clientDisconnected notification",
        )
        .await;
    }

    client.close().await;
    watcher.close().await;
    server.shutdown();
}

#[tokio::test]
async fn reserved_name_register_fails_into_default_value() {
    let (server, registry, port) = start_hub().await;

    let client = ConnectionManager::new(hub_address(port));
    let session_id: String = client
        .invoke("register", vec![json!(ADMIN_GROUP_NAME)])
        .await;

    // The lossy invoke contract: the caller sees the default value and
    // must consult last_error for the cause.
    assert_eq!(session_id, "");
    match client.last_error() {
        Some(groupcast_client::ClientError::Hub { code, .. }) => assert_eq!(code, 400),
        other => panic!("expected hub error, got {other:?}"),
    }
    assert_eq!(registry.client_count(), 0);

    client.close().await;
    server.shutdown();
}
