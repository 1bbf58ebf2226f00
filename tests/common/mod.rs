//! Integration test infrastructure.
//!
//! The core under test is the dispatch state machine, so these helpers
//! drive it directly: every "connection" is a handle whose outbound queue
//! the test holds the receiving end of, with an in-memory SQLite store
//! behind it. No sockets are involved.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use tether_proto::Message;
use tetherd::config::Config;
use tetherd::db::Database;
use tetherd::handlers::{self, HandlerError, MsgSource};
use tetherd::shared::Shared;
use tetherd::state::{ConnectionHandle, ConnectionKind, ConnectionState};

pub struct TestHarness {
    pub shared: Arc<Shared>,
}

impl TestHarness {
    pub async fn new() -> anyhow::Result<Self> {
        let db = Database::new(":memory:").await?;
        Ok(TestHarness {
            shared: Shared::new(Config::for_tests(), db),
        })
    }

    /// Seed one user with one network; returns `(user_id, network_id)`.
    ///
    /// The in-process in-memory store is shared between tests in the same
    /// binary, so callers pick usernames unique to their test.
    pub async fn seed_user_network(
        &self,
        username: &str,
        password: &str,
        network: &str,
    ) -> anyhow::Result<(i64, i64)> {
        let users = self.shared.db.users();
        let user = users.create_user(username, password).await?;
        let network_id = users
            .add_network(user.id, network, "irc.example.net", 6697, true, username)
            .await?;
        Ok((user.id, network_id))
    }

    /// A fresh downstream client, as the accept path would create it.
    pub async fn client(&self) -> TestClient {
        let con_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(256);
        let handle = ConnectionHandle::new(&con_id, ConnectionKind::Incoming, tx);
        {
            let mut state = handle.state.lock().await;
            state.server_prefix = self.shared.config.server.prefix.clone();
            state.connected = true;
        }
        self.shared.registry.insert(Arc::clone(&handle));
        TestClient { handle, rx }
    }

    /// A fake registered upstream for `(user_id, network_id)`, nick
    /// `alice`. The returned receiver observes everything forwarded to
    /// the network.
    pub async fn fake_upstream(
        &self,
        user_id: i64,
        network_id: i64,
        network_name: &str,
    ) -> TestUpstream {
        let con_id = ConnectionState::outgoing_con_id(user_id, network_id);
        let (tx, rx) = mpsc::channel(256);
        let handle = ConnectionHandle::new(&con_id, ConnectionKind::Outgoing, tx);
        {
            let mut state = handle.state.lock().await;
            state.loaded = true;
            state.connected = true;
            state.net_registered = true;
            state.received_motd = true;
            state.nick = "alice".to_string();
            state.auth_user_id = user_id;
            state.auth_network_id = network_id;
            state.auth_network_name = network_name.to_string();
        }
        self.shared.registry.insert(Arc::clone(&handle));
        TestUpstream { handle, rx }
    }

    /// Attach a client to an upstream the way the binder leaves them:
    /// pointer and linked set written together.
    pub async fn attach(&self, client: &TestClient, upstream: &TestUpstream) {
        let (user_id, network_id) = {
            let state = upstream.handle.state.lock().await;
            (state.auth_user_id, state.auth_network_id)
        };
        {
            let mut state = client.handle.state.lock().await;
            state.net_registered = true;
            state.loaded = true;
            state.auth_user_id = user_id;
            state.auth_network_id = network_id;
            state.upstream_con_id = Some(upstream.handle.con_id.clone());
        }
        upstream
            .handle
            .state
            .lock()
            .await
            .linked_incoming_con_ids
            .insert(client.handle.con_id.clone());
    }

    /// Dispatch one raw line from this client.
    pub async fn send(&self, client: &TestClient, line: &str) -> Result<(), HandlerError> {
        handlers::process_line(&self.shared, &client.handle, line, MsgSource::Socket).await
    }
}

pub struct TestClient {
    pub handle: Arc<ConnectionHandle>,
    pub rx: mpsc::Receiver<Message>,
}

impl TestClient {
    /// Everything queued for this client's wire, drained.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// First drained message with the given verb.
    pub fn find_verb(&mut self, verb: &str) -> Option<Message> {
        self.drain().into_iter().find(|m| m.verb == verb)
    }
}

pub struct TestUpstream {
    pub handle: Arc<ConnectionHandle>,
    pub rx: mpsc::Receiver<Message>,
}

impl TestUpstream {
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// The status lines (`PRIVMSG` from the bouncer prefix) in a drained
/// batch.
pub fn status_texts(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.verb == "PRIVMSG")
        .filter_map(|m| m.arg(1).map(str::to_string))
        .collect()
}
