//! Client registry: session -> logical client identity and group
//! membership.
//!
//! One registry instance is owned by the embedding process and injected
//! into the hub server; remote-call handlers receive it by handle rather
//! than reaching for process-wide state.
//!
//! Two independent triggers remove a session: an explicit `deregister`
//! call and the transport's disconnect notification. Both funnel into
//! [`remove_session`](ClientRegistry::remove_session), whose underlying
//! concurrent-map removal guarantees exactly one caller performs the
//! mutation; the loser observes a no-op. Notification behavior stays
//! per-trigger: `deregister` notifies unconditionally with the normalized
//! name, the disconnect path only when a record was actually removed,
//! with its original name.

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use groupcast_protocol::constants::{
    ADMIN_GROUP_NAME, EVENT_CLIENT_CONNECTED, EVENT_CLIENT_DISCONNECTED, NAME_SUFFIX_SEPARATOR,
};
use groupcast_protocol::messages::EventNotification;
use serde_json::Value;

use crate::connection::SessionHandle;
use crate::groups::Groups;

/// Errors raised synchronously to the remote caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid client name {0:?}: reserved")]
    ReservedName(String),
}

/// One registered client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_name: String,
    pub protocol_version: i32,
    pub session_id: String,
}

/// Concurrency-safe registry keyed by session id.
pub struct ClientRegistry {
    clients: DashMap<String, ClientRecord>,
    groups: Groups,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            groups: Groups::new(),
        }
    }

    /// Registers the calling session under `client_name`.
    ///
    /// Idempotent per session: a second call for an already-registered
    /// session changes nothing but still returns the session id.
    /// Registering under the reserved administrative name fails.
    pub fn register(
        &self,
        session: &SessionHandle,
        client_name: &str,
        version: i32,
    ) -> Result<String, RegistryError> {
        debug!(client = client_name, version, session = %session.id, "register");
        if client_name == ADMIN_GROUP_NAME {
            warn!(client = client_name, "rejected reserved client name");
            return Err(RegistryError::ReservedName(client_name.to_string()));
        }

        // Check-then-insert is not atomic; acceptable because no two
        // calls share one session id concurrently.
        if !self.clients.contains_key(&session.id) {
            let record = ClientRecord {
                client_name: client_name.to_string(),
                protocol_version: version,
                session_id: session.id.clone(),
            };
            self.clients.insert(session.id.clone(), record);
            self.groups.add(client_name, session);
            self.notify_admin(EVENT_CLIENT_CONNECTED, client_name);
            debug!(client = client_name, session = %session.id, "client added");
        }

        Ok(session.id.clone())
    }

    /// Removes the calling session's registration.
    ///
    /// The name is normalized (suffix truncated at the first
    /// non-leading separator) before group removal, and the
    /// administrative group is notified unconditionally — even when no
    /// record existed for the session.
    pub fn deregister(&self, session_id: &str, client_name: &str) -> String {
        let normalized = normalize_client_name(client_name);
        debug!(client = %normalized, session = session_id, "deregister");

        if let Some(record) = self.remove_session(session_id) {
            debug!(client = %record.client_name, session = session_id, "client removed");
        } else {
            // No record: still scrub any stray membership under the
            // normalized name.
            self.groups.remove(&normalized, session_id);
        }

        self.notify_admin(EVENT_CLIENT_DISCONNECTED, &normalized);
        session_id.to_string()
    }

    /// Transport-driven removal: the session ended, gracefully or by
    /// timeout. Notifies with the record's original name; an unknown
    /// session does nothing.
    pub fn handle_disconnect(&self, session_id: &str) {
        if let Some(record) = self.remove_session(session_id) {
            debug!(
                client = %record.client_name,
                session = session_id,
                "client removed on disconnect"
            );
            self.notify_admin(EVENT_CLIENT_DISCONNECTED, &record.client_name);
        }
    }

    /// The single removal primitive both triggers call: removes the
    /// record and its group membership. Exactly one concurrent caller
    /// gets the record; the rest observe `None`.
    pub fn remove_session(&self, session_id: &str) -> Option<ClientRecord> {
        let (_, record) = self.clients.remove(session_id)?;
        self.groups.remove(&record.client_name, session_id);
        Some(record)
    }

    /// First record matching `client_name` with a protocol version of at
    /// least `min_version`. Tie-break among sessions sharing a name is
    /// iteration order.
    pub fn find_by_name(&self, client_name: &str, min_version: i32) -> Option<ClientRecord> {
        self.clients
            .iter()
            .find(|entry| {
                entry.value().client_name == client_name
                    && entry.value().protocol_version >= min_version
            })
            .map(|entry| entry.value().clone())
    }

    /// Adds a session to an arbitrary group. This is how an embedder
    /// places watcher sessions into the administrative group.
    pub fn add_to_group(&self, group: &str, session: &SessionHandle) {
        self.groups.add(group, session);
    }

    /// Broadcasts a named event to a group. Per-client groups make this
    /// unicast-by-name. Returns the number of sessions addressed.
    pub fn broadcast(&self, group: &str, event: &str, args: Vec<Value>) -> usize {
        self.groups.broadcast(
            group,
            &EventNotification {
                event: event.to_string(),
                args,
            },
        )
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.clients.contains_key(session_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups.members_of(group)
    }

    fn notify_admin(&self, event: &str, client_name: &str) {
        let delivered = self
            .groups
            .broadcast(ADMIN_GROUP_NAME, &EventNotification::with_name(event, client_name));
        trace!(event, client = client_name, delivered, "admin notification");
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates a client name at the first separator, so suffixed variants
/// collapse to a common root. A leading separator is not a suffix.
pub(crate) fn normalize_client_name(name: &str) -> String {
    match name.find(NAME_SUFFIX_SEPARATOR) {
        Some(i) if i > 0 => name[..i].to_string(),
        _ => name.to_string(),
    }
}
