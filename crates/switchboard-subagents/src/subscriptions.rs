//! Node subscription index: gateway event fan-out.
//!
//! Connected gateway nodes subscribe to session keys; events for a
//! session are then fanned out to every subscribed node. The index keeps
//! the `node → sessions` and `session → nodes` maps symmetric at all
//! times, and never leaves empty sets behind.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

/// Sink for pushing a serialized event to one connected node.
pub trait NodeSender: Send + Sync {
    /// Deliver `payload` (already-serialized JSON) for `event` to a node.
    fn send(&self, node_id: &str, event: &str, payload: &str);
}

/// Enumerates currently-connected nodes, subscriptions aside.
pub trait NodeLister: Send + Sync {
    /// Ids of every connected node.
    fn list(&self) -> Vec<String>;
}

#[derive(Default)]
struct Maps {
    node_sessions: HashMap<String, HashSet<String>>,
    session_nodes: HashMap<String, HashSet<String>>,
}

/// Bidirectional node ↔ session subscription index.
#[derive(Default)]
pub struct NodeSubscriptionIndex {
    maps: Mutex<Maps>,
}

impl NodeSubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a node to a session. Empty inputs are a no-op.
    pub fn subscribe(&self, node_id: &str, session_key: &str) {
        let node_id = node_id.trim();
        let session_key = session_key.trim();
        if node_id.is_empty() || session_key.is_empty() {
            return;
        }
        let mut maps = self.maps.lock();
        let _ = maps
            .node_sessions
            .entry(node_id.to_owned())
            .or_default()
            .insert(session_key.to_owned());
        let _ = maps
            .session_nodes
            .entry(session_key.to_owned())
            .or_default()
            .insert(node_id.to_owned());
    }

    /// Remove one node → session subscription, pruning emptied sets.
    pub fn unsubscribe(&self, node_id: &str, session_key: &str) {
        let node_id = node_id.trim();
        let session_key = session_key.trim();
        if node_id.is_empty() || session_key.is_empty() {
            return;
        }
        let mut maps = self.maps.lock();
        remove_pairwise(&mut maps.node_sessions, node_id, session_key);
        remove_pairwise(&mut maps.session_nodes, session_key, node_id);
    }

    /// Drop every subscription a node holds (e.g. on disconnect).
    pub fn unsubscribe_all(&self, node_id: &str) {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return;
        }
        let mut maps = self.maps.lock();
        let Some(sessions) = maps.node_sessions.remove(node_id) else {
            return;
        };
        for session_key in sessions {
            remove_pairwise(&mut maps.session_nodes, &session_key, node_id);
        }
    }

    /// Session keys a node is subscribed to.
    #[must_use]
    pub fn sessions_for(&self, node_id: &str) -> Vec<String> {
        self.maps
            .lock()
            .node_sessions
            .get(node_id.trim())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Node ids subscribed to a session.
    #[must_use]
    pub fn nodes_for(&self, session_key: &str) -> Vec<String> {
        self.maps
            .lock()
            .session_nodes
            .get(session_key.trim())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fan an event out to every node subscribed to a session.
    ///
    /// The payload is serialized once; a missing sender is a silent no-op.
    pub fn send_to_session(
        &self,
        session_key: &str,
        event: &str,
        payload: &Value,
        sender: Option<&dyn NodeSender>,
    ) {
        let Some(sender) = sender else { return };
        let Some(serialized) = serialize_payload(event, payload) else {
            return;
        };
        for node_id in self.nodes_for(session_key) {
            sender.send(&node_id, event, &serialized);
        }
    }

    /// Fan an event out to every node holding at least one subscription.
    pub fn send_to_all_subscribed(
        &self,
        event: &str,
        payload: &Value,
        sender: Option<&dyn NodeSender>,
    ) {
        let Some(sender) = sender else { return };
        let Some(serialized) = serialize_payload(event, payload) else {
            return;
        };
        let node_ids: Vec<String> = {
            let maps = self.maps.lock();
            maps.node_sessions.keys().cloned().collect()
        };
        for node_id in node_ids {
            sender.send(&node_id, event, &serialized);
        }
    }

    /// Fan an event out to every connected node, subscriptions aside.
    ///
    /// Missing lister or sender is a silent no-op.
    pub fn send_to_all_connected(
        &self,
        event: &str,
        payload: &Value,
        lister: Option<&dyn NodeLister>,
        sender: Option<&dyn NodeSender>,
    ) {
        let (Some(lister), Some(sender)) = (lister, sender) else {
            return;
        };
        let Some(serialized) = serialize_payload(event, payload) else {
            return;
        };
        for node_id in lister.list() {
            sender.send(&node_id, event, &serialized);
        }
    }
}

fn serialize_payload(event: &str, payload: &Value) -> Option<String> {
    match serde_json::to_string(payload) {
        Ok(s) => Some(s),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize fan-out payload");
            None
        }
    }
}

fn remove_pairwise(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) {
    if let Some(set) = map.get_mut(key) {
        let _ = set.remove(value);
        if set.is_empty() {
            let _ = map.remove(key);
        }
    }
}
