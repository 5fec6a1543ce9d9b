//! Named broadcast groups.
//!
//! A group is a set of sessions addressed by name. Per-client groups
//! (named after the client) give the hub unicast-by-broadcast to every
//! session registered under one name; the administrative group receives
//! membership notifications. Empty groups are pruned.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::trace;

use groupcast_protocol::messages::EventNotification;

use crate::connection::{Sender, SessionHandle};

/// Group membership table: group name -> {session id -> sender}.
pub struct Groups {
    members: DashMap<String, HashMap<String, Sender>>,
}

impl Groups {
    pub fn new() -> Self {
        Self {
            members: DashMap::new(),
        }
    }

    /// Adds a session to a group.
    pub fn add(&self, group: &str, session: &SessionHandle) {
        self.members
            .entry(group.to_string())
            .or_default()
            .insert(session.id.clone(), session.sender.clone());
        trace!(group, session = %session.id, "added to group");
    }

    /// Removes a session from a group. Removing an absent member is a
    /// no-op.
    pub fn remove(&self, group: &str, session_id: &str) {
        if let Some(mut entry) = self.members.get_mut(group) {
            entry.remove(session_id);
        }
        self.members.remove_if(group, |_, m| m.is_empty());
    }

    /// Sends an event to every member of a group. Returns the number of
    /// sessions the event was handed to; a missing group delivers to none.
    pub fn broadcast(&self, group: &str, notification: &EventNotification) -> usize {
        let senders: Vec<Sender> = match self.members.get(group) {
            Some(entry) => entry.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for sender in &senders {
            if sender.send_event(notification).is_ok() {
                delivered += 1;
            }
        }
        trace!(group, event = %notification.event, delivered, "broadcast");
        delivered
    }

    /// Session ids currently in a group.
    pub fn members_of(&self, group: &str) -> Vec<String> {
        self.members
            .get(group)
            .map(|entry| entry.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, group: &str, session_id: &str) -> bool {
        self.members
            .get(group)
            .is_some_and(|entry| entry.contains_key(session_id))
    }
}

impl Default for Groups {
    fn default() -> Self {
        Self::new()
    }
}
