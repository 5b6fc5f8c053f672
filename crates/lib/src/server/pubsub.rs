//! Watch subscriptions: which connection cares about which event.
//!
//! The registry is plain bookkeeping. It never delivers anything itself;
//! the dispatcher looks up watchers and pushes through each connection's
//! outbound queue.

use std::collections::{HashMap, HashSet};

use super::ConnId;

/// Event name to connection mapping, with the reverse index kept alongside
/// so tearing a connection down is one call.
#[derive(Debug, Default)]
pub struct PubSubRegistry {
    by_event: HashMap<String, HashSet<ConnId>>,
    by_conn: HashMap<ConnId, HashSet<String>>,
}

impl PubSubRegistry {
    pub fn new() -> Self {
        PubSubRegistry::default()
    }

    /// Subscribe `conn` to `event`. Returns false when it already was.
    pub fn watch(&mut self, conn: ConnId, event: &str) -> bool {
        let added = self
            .by_event
            .entry(event.to_string())
            .or_default()
            .insert(conn);
        if added {
            self.by_conn.entry(conn).or_default().insert(event.to_string());
        }
        added
    }

    /// Drop the `(conn, event)` subscription, if present.
    pub fn unwatch(&mut self, conn: ConnId, event: &str) {
        if let Some(conns) = self.by_event.get_mut(event) {
            conns.remove(&conn);
            if conns.is_empty() {
                self.by_event.remove(event);
            }
        }
        if let Some(events) = self.by_conn.get_mut(&conn) {
            events.remove(event);
            if events.is_empty() {
                self.by_conn.remove(&conn);
            }
        }
    }

    /// Drop every subscription `conn` holds.
    pub fn unwatch_all(&mut self, conn: ConnId) {
        let Some(events) = self.by_conn.remove(&conn) else {
            return;
        };
        for event in events {
            if let Some(conns) = self.by_event.get_mut(&event) {
                conns.remove(&conn);
                if conns.is_empty() {
                    self.by_event.remove(&event);
                }
            }
        }
    }

    /// Whether `conn` is subscribed to `event`.
    pub fn is_watching(&self, conn: ConnId, event: &str) -> bool {
        self.by_event
            .get(event)
            .is_some_and(|conns| conns.contains(&conn))
    }

    /// Every connection subscribed to `event`, in no particular order.
    pub fn watchers(&self, event: &str) -> impl Iterator<Item = ConnId> + '_ {
        self.by_event.get(event).into_iter().flatten().copied()
    }
}
