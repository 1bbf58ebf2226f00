//! The durable per-connection record.
//!
//! One `ConnectionState` exists per socket, downstream or upstream. The
//! record outlives the socket: it is written to the `connections` table on
//! every meaningful transition and hydrated back on first use, which is how
//! a restarted process resumes its upstream sessions and how a mid-CAP
//! downstream handshake survives a bounce.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tether_proto::{irc_to_lower, isupport};

use crate::db::{ConnectionRow, Database, DbError, SaslCredentials};
use crate::state::Buffer;

/// What kind of socket a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Upstream link from the bouncer to an IRC network.
    Outgoing,
    /// Downstream client attached to the bouncer.
    Incoming,
    /// Listening socket.
    Listener,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Outgoing => "outgoing",
            ConnectionKind::Incoming => "incoming",
            ConnectionKind::Listener => "listener",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "outgoing" => ConnectionKind::Outgoing,
            "listener" => ConnectionKind::Listener,
            _ => ConnectionKind::Incoming,
        }
    }
}

/// The PASS/NICK/USER triple collected while a downstream registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegAttempt {
    pub nick: String,
    pub user: String,
    pub pass: String,
}

/// Transient registration scratch.
///
/// Persisted with the rest of the record so a restart mid-handshake picks
/// up where it left off; each field is cleared when its phase ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegScratch {
    /// CAP protocol version while the LS..END window is open.
    pub capping: Option<String>,
    /// Raw lines held back during the CAP window, in arrival order.
    pub queue: Vec<String>,
    /// Registration triple, present until registration resolves.
    pub reg: Option<RegAttempt>,
}

/// Durable state of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub con_id: String,
    pub kind: ConnectionKind,
    /// Whether the record has been hydrated from the store.
    pub loaded: bool,
    /// Incoming: BNC auth + registration complete. Outgoing: upstream
    /// accepted NICK/USER and reached end-of-MOTD.
    pub net_registered: bool,
    /// Transport is open.
    pub connected: bool,
    /// `:prefix` used on lines the bouncer synthesizes.
    pub server_prefix: String,

    pub nick: String,
    pub username: String,
    pub realname: String,
    pub account: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_verify: bool,
    pub bind_host: String,
    pub sasl: Option<SaslCredentials>,

    /// Raw lines captured from upstream between connect and end-of-MOTD.
    pub registration_lines: Vec<String>,
    /// ISUPPORT tokens from upstream, in arrival order.
    pub isupports: Vec<String>,
    /// Negotiated capability names.
    pub caps: HashSet<String>,
    /// Lowercased buffer name -> buffer.
    pub buffers: HashMap<String, Buffer>,
    pub received_motd: bool,

    pub auth_user_id: i64,
    pub auth_network_id: i64,
    pub auth_network_name: String,
    pub auth_admin: bool,

    /// Incoming only: con_id of the bound upstream.
    pub upstream_con_id: Option<String>,
    /// Outgoing only: con_ids of attached clients.
    pub linked_incoming_con_ids: HashSet<String>,
    /// Whether traffic on this upstream goes to the message log.
    pub logging: bool,

    pub scratch: RegScratch,
}

impl ConnectionState {
    /// Fresh record with defaults; not yet hydrated.
    pub fn new(con_id: &str, kind: ConnectionKind) -> Self {
        ConnectionState {
            con_id: con_id.to_string(),
            kind,
            loaded: false,
            net_registered: false,
            connected: false,
            server_prefix: "bnc".to_string(),
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
            account: String::new(),
            password: String::new(),
            host: String::new(),
            port: 6667,
            tls: false,
            tls_verify: true,
            bind_host: String::new(),
            sasl: None,
            registration_lines: Vec::new(),
            isupports: Vec::new(),
            caps: HashSet::new(),
            buffers: HashMap::new(),
            received_motd: false,
            auth_user_id: 0,
            auth_network_id: 0,
            auth_network_name: String::new(),
            auth_admin: false,
            upstream_con_id: None,
            linked_incoming_con_ids: HashSet::new(),
            logging: true,
            scratch: RegScratch::default(),
        }
    }

    /// Stable con_id used for a user's upstream to one network. Giving the
    /// outgoing record a deterministic key is what lets a restarted process
    /// find its own row again.
    pub fn outgoing_con_id(user_id: i64, network_id: i64) -> String {
        format!("out-{user_id}-{network_id}")
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Hydrate from the store unless already done.
    pub async fn maybe_load(&mut self, db: &Database) -> Result<(), DbError> {
        if self.loaded {
            return Ok(());
        }
        self.load(db).await
    }

    /// Replace in-memory fields from the persisted row; absent row leaves
    /// the defaults in place.
    pub async fn load(&mut self, db: &Database) -> Result<(), DbError> {
        if let Some(row) = db.connections().fetch(&self.con_id).await? {
            self.apply_row(&row)?;
        }
        self.loaded = true;
        Ok(())
    }

    /// Write the whole record, insert-or-replace.
    pub async fn save(&self, db: &Database) -> Result<(), DbError> {
        db.connections().save(&self.to_row()?).await
    }

    /// Remove the persisted row.
    pub async fn destroy(&self, db: &Database) -> Result<(), DbError> {
        db.connections().delete(&self.con_id).await?;
        Ok(())
    }

    /// Mutate the registration scratch and persist immediately.
    pub async fn scratch_update<F>(&mut self, db: &Database, apply: F) -> Result<(), DbError>
    where
        F: FnOnce(&mut RegScratch),
    {
        apply(&mut self.scratch);
        self.save(db).await
    }

    fn to_row(&self) -> Result<ConnectionRow, DbError> {
        let mut caps: Vec<&String> = self.caps.iter().collect();
        caps.sort();
        let mut linked: Vec<&String> = self.linked_incoming_con_ids.iter().collect();
        linked.sort();
        let mut buffers: Vec<&Buffer> = self.buffers.values().collect();
        buffers.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ConnectionRow {
            conid: self.con_id.clone(),
            kind: self.kind.as_str().to_string(),
            net_registered: self.net_registered,
            connected: self.connected,
            server_prefix: self.server_prefix.clone(),
            nick: self.nick.clone(),
            username: self.username.clone(),
            realname: self.realname.clone(),
            account: self.account.clone(),
            password: self.password.clone(),
            host: self.host.clone(),
            port: i64::from(self.port),
            tls: self.tls,
            tls_verify: self.tls_verify,
            bind_host: self.bind_host.clone(),
            sasl: serde_json::to_string(&self.sasl.as_ref().map(|s| SaslJson {
                account: s.account.clone(),
                password: s.password.clone(),
            }))?,
            registration_lines: serde_json::to_string(&self.registration_lines)?,
            isupports: serde_json::to_string(&self.isupports)?,
            caps: serde_json::to_string(&caps)?,
            buffers: serde_json::to_string(&buffers)?,
            received_motd: self.received_motd,
            auth_user_id: self.auth_user_id,
            auth_network_id: self.auth_network_id,
            auth_network_name: self.auth_network_name.clone(),
            auth_admin: self.auth_admin,
            upstream_conid: self.upstream_con_id.clone(),
            linked_incoming: serde_json::to_string(&linked)?,
            logging: self.logging,
            scratch: serde_json::to_string(&self.scratch)?,
        })
    }

    fn apply_row(&mut self, row: &ConnectionRow) -> Result<(), DbError> {
        self.kind = ConnectionKind::from_str(&row.kind);
        self.net_registered = row.net_registered;
        self.connected = row.connected;
        self.server_prefix = row.server_prefix.clone();
        self.nick = row.nick.clone();
        self.username = row.username.clone();
        self.realname = row.realname.clone();
        self.account = row.account.clone();
        self.password = row.password.clone();
        self.host = row.host.clone();
        self.port = row.port as u16;
        self.tls = row.tls;
        self.tls_verify = row.tls_verify;
        self.bind_host = row.bind_host.clone();
        self.sasl = serde_json::from_str::<Option<SaslJson>>(&row.sasl)?.map(|s| {
            SaslCredentials {
                account: s.account,
                password: s.password,
            }
        });
        self.registration_lines = serde_json::from_str(&row.registration_lines)?;
        self.isupports = serde_json::from_str(&row.isupports)?;
        let caps: Vec<String> = serde_json::from_str(&row.caps)?;
        self.caps = caps.into_iter().collect();
        self.buffers.clear();
        let buffers: Vec<Buffer> = serde_json::from_str(&row.buffers)?;
        for buffer in buffers {
            self.add_buffer(buffer);
        }
        self.received_motd = row.received_motd;
        self.auth_user_id = row.auth_user_id;
        self.auth_network_id = row.auth_network_id;
        self.auth_network_name = row.auth_network_name.clone();
        self.auth_admin = row.auth_admin;
        self.upstream_con_id = row.upstream_conid.clone();
        let linked: Vec<String> = serde_json::from_str(&row.linked_incoming)?;
        self.linked_incoming_con_ids = linked.into_iter().collect();
        self.logging = row.logging;
        self.scratch = serde_json::from_str(&row.scratch)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// CHANTYPES from upstream ISUPPORT, or the RFC default.
    pub fn chantypes(&self) -> &str {
        isupport::chantypes(&self.isupports).unwrap_or(isupport::DEFAULT_CHANTYPES)
    }

    pub fn get_buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(&irc_to_lower(name))
    }

    pub fn get_buffer_mut(&mut self, name: &str) -> Option<&mut Buffer> {
        self.buffers.get_mut(&irc_to_lower(name))
    }

    /// Insert a buffer under its lowercased name.
    pub fn add_buffer(&mut self, buffer: Buffer) -> &mut Buffer {
        let key = irc_to_lower(&buffer.name);
        self.buffers.entry(key).or_insert(buffer)
    }

    /// Existing buffer, or a new one typed from this connection's
    /// CHANTYPES.
    pub fn get_or_add_buffer(&mut self, name: &str) -> &mut Buffer {
        let key = irc_to_lower(name);
        if !self.buffers.contains_key(&key) {
            let is_channel = isupport::is_channel_name(name, self.chantypes());
            self.buffers.insert(key.clone(), Buffer::new(name, is_channel));
        }
        self.buffers.get_mut(&key).expect("buffer just inserted")
    }

    /// Remove a buffer; returns it when one existed.
    pub fn del_buffer(&mut self, name: &str) -> Option<Buffer> {
        self.buffers.remove(&irc_to_lower(name))
    }

    /// Move a buffer to a new name. When a buffer already exists under the
    /// new name the move is a no-op merge and the existing buffer wins.
    pub fn rename_buffer(&mut self, from: &str, to: &str) -> Option<&mut Buffer> {
        let to_key = irc_to_lower(to);
        if self.buffers.contains_key(&to_key) {
            return self.buffers.get_mut(&to_key);
        }
        let mut buffer = self.buffers.remove(&irc_to_lower(from))?;
        buffer.name = to.to_string();
        self.buffers.insert(to_key.clone(), buffer);
        self.buffers.get_mut(&to_key)
    }

    // ------------------------------------------------------------------
    // Linked clients
    // ------------------------------------------------------------------

    /// Attach a client id to this upstream and persist.
    pub async fn link_incoming_connection(
        &mut self,
        db: &Database,
        con_id: &str,
    ) -> Result<(), DbError> {
        self.linked_incoming_con_ids.insert(con_id.to_string());
        self.save(db).await
    }

    /// Detach a client id from this upstream and persist.
    pub async fn unlink_incoming_connection(
        &mut self,
        db: &Database,
        con_id: &str,
    ) -> Result<(), DbError> {
        self.linked_incoming_con_ids.remove(con_id);
        self.save(db).await
    }

    // ------------------------------------------------------------------
    // Network metadata
    // ------------------------------------------------------------------

    /// Refresh an outgoing record's transport fields from the user store.
    ///
    /// `bind_host` prefers the network's own setting and falls back to the
    /// owning user's. A deleted network clears the transport fields, but
    /// the live nick is kept while the link is up: the IRC-side identity
    /// must not change under an open session.
    pub async fn load_connection_info(&mut self, db: &Database) -> Result<(), DbError> {
        let users = db.users();
        let network = users.get_network(self.auth_network_id).await?;

        let Some(network) = network else {
            self.host.clear();
            self.port = 6667;
            self.tls = false;
            self.tls_verify = true;
            self.bind_host.clear();
            self.password.clear();
            self.sasl = None;
            if !self.connected {
                self.nick.clear();
            }
            return Ok(());
        };

        self.auth_user_id = network.user_id;
        self.auth_network_name = network.name.clone();
        self.host = network.host.clone();
        self.port = network.port;
        self.tls = network.tls;
        self.tls_verify = network.tls_verify;
        self.password = network.server_password.clone();
        self.sasl = network.sasl.clone();
        if !self.connected {
            self.nick = network.nick.clone();
        }
        self.username = network.username.clone();
        self.realname = network.realname.clone();
        self.account = network.account.clone();

        self.bind_host = if !network.bind_host.is_empty() {
            network.bind_host.clone()
        } else if let Some(user) = users.get_user(network.user_id).await? {
            user.bind_host
        } else {
            String::new()
        };

        Ok(())
    }
}

/// Wire form of the SASL pair inside the row JSON.
#[derive(Serialize, Deserialize)]
struct SaslJson {
    account: String,
    password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_keys_are_lowercased() {
        let mut con = ConnectionState::new("c1", ConnectionKind::Outgoing);
        con.get_or_add_buffer("#Rust[Lang]");
        assert!(con.buffers.contains_key("#rust{lang}"));
        assert_eq!(con.get_buffer("#RUST[lang]").unwrap().name, "#Rust[Lang]");
    }

    #[test]
    fn chantypes_decides_is_channel() {
        let mut con = ConnectionState::new("c1", ConnectionKind::Outgoing);
        con.isupports.push("CHANTYPES=#".to_string());
        assert!(con.get_or_add_buffer("#chan").is_channel);
        assert!(!con.get_or_add_buffer("&notachan").is_channel);
        assert!(!con.get_or_add_buffer("bob").is_channel);
    }

    #[test]
    fn default_chantypes_without_upstream_context() {
        let mut con = ConnectionState::new("c1", ConnectionKind::Outgoing);
        assert!(con.get_or_add_buffer("#chan").is_channel);
        assert!(con.get_or_add_buffer("&local").is_channel);
    }

    #[test]
    fn rename_moves_key_and_name() {
        let mut con = ConnectionState::new("c1", ConnectionKind::Outgoing);
        con.get_or_add_buffer("#old").topic = "t".into();
        let renamed = con.rename_buffer("#old", "#New").unwrap();
        assert_eq!(renamed.name, "#New");
        assert_eq!(renamed.topic, "t");
        assert!(con.get_buffer("#old").is_none());
        assert!(con.buffers.contains_key("#new"));
    }

    #[test]
    fn rename_onto_existing_is_merge() {
        let mut con = ConnectionState::new("c1", ConnectionKind::Outgoing);
        con.get_or_add_buffer("#a").topic = "keep".into();
        con.get_or_add_buffer("#b");
        let merged = con.rename_buffer("#b", "#A").unwrap();
        assert_eq!(merged.topic, "keep");
        // the source buffer is untouched by the merge
        assert!(con.get_buffer("#b").is_some());
    }

    #[test]
    fn outgoing_con_id_is_stable() {
        assert_eq!(ConnectionState::outgoing_con_id(4, 9), "out-4-9");
    }
}
