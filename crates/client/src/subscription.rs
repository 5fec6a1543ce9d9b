//! Named push-event subscriptions.
//!
//! One registration table per session; handlers are uniform over a
//! positional-argument slice (0..=[`MAX_EVENT_ARGS`] values) rather than
//! one shape per arity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;
use tracing::warn;

use groupcast_protocol::constants::MAX_EVENT_ARGS;

/// Handler for a push event: receives the event's positional arguments.
pub type EventHandler = Box<dyn Fn(&[Value]) + Send + Sync>;

/// Registration table mapping event names to handlers.
pub(crate) struct SubscriptionTable {
    handlers: RwLock<HashMap<String, Vec<(u64, Arc<EventHandler>)>>>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a handler and returns its disposable token.
    pub(crate) fn add(self: &Arc<Self>, event: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.handlers.write() {
            map.entry(event.to_string())
                .or_default()
                .push((id, Arc::new(handler)));
        }
        Subscription {
            event: event.to_string(),
            id,
            table: Arc::downgrade(self),
        }
    }

    pub(crate) fn remove(&self, event: &str, id: u64) {
        if let Ok(mut map) = self.handlers.write() {
            let now_empty = match map.get_mut(event) {
                Some(list) => {
                    list.retain(|(hid, _)| *hid != id);
                    list.is_empty()
                }
                None => false,
            };
            if now_empty {
                map.remove(event);
            }
        }
    }

    /// Invokes every handler registered for `event`. Returns the number of
    /// handlers called. Events exceeding the arity bound are dropped.
    pub(crate) fn dispatch(&self, event: &str, args: &[Value]) -> usize {
        if args.len() > MAX_EVENT_ARGS {
            warn!(
                event,
                arity = args.len(),
                "event exceeds maximum arity, dropping"
            );
            return 0;
        }
        let handlers: Vec<Arc<EventHandler>> = match self.handlers.read() {
            Ok(map) => map
                .get(event)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for handler in &handlers {
            handler(args);
        }
        handlers.len()
    }
}

/// Disposable subscription token returned by `subscribe`.
///
/// Dropping the token (or calling [`dispose`](Self::dispose)) unregisters
/// the handler. Tokens outlive a lightweight session restart but not a
/// full reconnect, which recreates the session and its table.
pub struct Subscription {
    event: String,
    id: u64,
    table: Weak<SubscriptionTable>,
}

impl Subscription {
    /// Name of the subscribed event.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Unregisters the handler.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.event, self.id);
        }
    }
}
