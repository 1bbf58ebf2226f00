//! Process-wide index of live connections.
//!
//! Cross-connection references are con_ids resolved here at the point of
//! use, never direct references, so the downstream -> upstream ->
//! downstream-set cycle stays a graph of strings.
//!
//! # Lock order
//!
//! A handler may lock its own (incoming) state and then an upstream state,
//! never the reverse; the upstream session task only ever locks its own
//! state. Fan-out resolves handles under the upstream lock but sends after
//! releasing it.

use std::sync::Arc;

use dashmap::DashMap;
use tether_proto::Message;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;

use crate::state::{ConnectionKind, ConnectionState};

/// A live connection: its durable state plus the outbound wire queue.
pub struct ConnectionHandle {
    pub con_id: String,
    pub kind: ConnectionKind,
    /// Outbound queue drained by the connection's writer task.
    pub sender: mpsc::Sender<Message>,
    /// Signalled to make the connection task close its transport.
    pub close: Notify,
    /// Outgoing only: signalled to make the session task (re)dial.
    pub open: Notify,
    pub state: Mutex<ConnectionState>,
}

impl ConnectionHandle {
    pub fn new(con_id: &str, kind: ConnectionKind, sender: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(ConnectionHandle {
            con_id: con_id.to_string(),
            kind,
            sender,
            close: Notify::new(),
            open: Notify::new(),
            state: Mutex::new(ConnectionState::new(con_id, kind)),
        })
    }

    /// Queue a line for the wire. A closed connection is terminal but not
    /// an error: the write is dropped.
    pub async fn send(&self, msg: Message) {
        if self.sender.send(msg).await.is_err() {
            debug!(con_id = %self.con_id, "Write to closed connection dropped");
        }
    }
}

/// The registry of live connections, keyed by con_id.
#[derive(Default)]
pub struct Registry {
    cons: DashMap<String, Arc<ConnectionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.cons.insert(handle.con_id.clone(), handle);
    }

    pub fn remove(&self, con_id: &str) {
        self.cons.remove(con_id);
    }

    /// Point-in-time lookup; a just-removed entry reads as absent.
    pub fn get(&self, con_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.cons.get(con_id).map(|entry| Arc::clone(entry.value()))
    }

    /// The single live upstream for a `(user, network)` pair, if any.
    ///
    /// Outgoing con_ids are deterministic, so this is a direct lookup
    /// rather than a scan.
    pub fn find_users_outgoing_connection(
        &self,
        user_id: i64,
        network_id: i64,
    ) -> Option<Arc<ConnectionHandle>> {
        self.get(&ConnectionState::outgoing_con_id(user_id, network_id))
    }

    /// Resolve the clients linked to an upstream, skipping `exclude`.
    ///
    /// The id set is copied under the upstream lock; the returned handles
    /// are used after it is released.
    pub async fn linked_clients(
        &self,
        upstream: &ConnectionHandle,
        exclude: Option<&str>,
    ) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<String> = {
            let state = upstream.state.lock().await;
            state.linked_incoming_con_ids.iter().cloned().collect()
        };
        ids.iter()
            .filter(|id| exclude != Some(id.as_str()))
            .filter_map(|id| self.get(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(con_id: &str, kind: ConnectionKind) -> Arc<ConnectionHandle> {
        let (tx, _rx) = mpsc::channel(8);
        ConnectionHandle::new(con_id, kind, tx)
    }

    #[tokio::test]
    async fn outgoing_lookup_by_pair() {
        let registry = Registry::new();
        let upstream = handle("out-4-9", ConnectionKind::Outgoing);
        registry.insert(Arc::clone(&upstream));

        assert!(registry.find_users_outgoing_connection(4, 9).is_some());
        assert!(registry.find_users_outgoing_connection(4, 8).is_none());

        registry.remove("out-4-9");
        assert!(registry.find_users_outgoing_connection(4, 9).is_none());
    }

    #[tokio::test]
    async fn linked_clients_skips_excluded_and_dead() {
        let registry = Registry::new();
        let upstream = handle("out-1-1", ConnectionKind::Outgoing);
        let d1 = handle("d1", ConnectionKind::Incoming);
        let d2 = handle("d2", ConnectionKind::Incoming);
        registry.insert(Arc::clone(&upstream));
        registry.insert(d1);
        registry.insert(d2);

        {
            let mut state = upstream.state.lock().await;
            state.linked_incoming_con_ids.insert("d1".into());
            state.linked_incoming_con_ids.insert("d2".into());
            state.linked_incoming_con_ids.insert("gone".into());
        }

        let siblings = registry.linked_clients(&upstream, Some("d1")).await;
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].con_id, "d2");
    }
}
