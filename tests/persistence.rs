//! Durability of connection records.

use tetherd::db::{Database, SaslCredentials};
use tetherd::state::{Buffer, ConnectionKind, ConnectionState, RegAttempt};

fn populated_state(con_id: &str) -> ConnectionState {
    let mut state = ConnectionState::new(con_id, ConnectionKind::Outgoing);
    state.loaded = true;
    state.net_registered = true;
    state.connected = true;
    state.nick = "alice".to_string();
    state.username = "alice".to_string();
    state.realname = "Alice".to_string();
    state.host = "irc.example.net".to_string();
    state.port = 6697;
    state.tls = true;
    state.tls_verify = false;
    state.bind_host = "10.0.0.1".to_string();
    state.password = "serverpass".to_string();
    state.sasl = Some(SaslCredentials {
        account: "alice".to_string(),
        password: "saslpw".to_string(),
    });
    state
        .registration_lines
        .push(":irc.example.net 001 alice :Welcome".to_string());
    state
        .registration_lines
        .push(":irc.example.net 376 alice :End of /MOTD command.".to_string());
    state.isupports.push("CHANTYPES=#&".to_string());
    state.isupports.push("NICKLEN=30".to_string());
    state.caps.insert("server-time".to_string());
    state.received_motd = true;
    state.auth_user_id = 4;
    state.auth_network_id = 9;
    state.auth_network_name = "freenode".to_string();
    state.linked_incoming_con_ids.insert("d1".to_string());
    state.linked_incoming_con_ids.insert("d2".to_string());

    let chan = state.add_buffer(Buffer::new("#Rust", true));
    chan.joined = true;
    chan.topic = "the topic".to_string();
    chan.key = "hunter2".to_string();
    state.add_buffer(Buffer::new("bob", false));

    state
}

#[tokio::test]
async fn save_load_round_trip() -> anyhow::Result<()> {
    let db = Database::new(":memory:").await?;
    let original = populated_state("rt-1");
    original.save(&db).await?;

    let mut restored = ConnectionState::new("rt-1", ConnectionKind::Outgoing);
    restored.load(&db).await?;

    assert_eq!(restored, original);
    Ok(())
}

#[tokio::test]
async fn save_is_insert_or_replace() -> anyhow::Result<()> {
    let db = Database::new(":memory:").await?;
    let mut state = populated_state("rt-2");
    state.save(&db).await?;

    state.nick = "alice_".to_string();
    state.del_buffer("bob");
    state.save(&db).await?;

    let mut restored = ConnectionState::new("rt-2", ConnectionKind::Outgoing);
    restored.load(&db).await?;
    assert_eq!(restored.nick, "alice_");
    assert!(restored.get_buffer("bob").is_none());
    assert!(restored.get_buffer("#rust").is_some());
    Ok(())
}

#[tokio::test]
async fn mid_handshake_scratch_survives_restart() -> anyhow::Result<()> {
    let db = Database::new(":memory:").await?;

    let mut state = ConnectionState::new("rt-3", ConnectionKind::Incoming);
    state.loaded = true;
    state.scratch.capping = Some("302".to_string());
    state.scratch.queue.push("NICK bob".to_string());
    state.scratch.queue.push("USER bob 0 * :Bob".to_string());
    state.scratch.reg = Some(RegAttempt {
        nick: String::new(),
        user: String::new(),
        pass: "alice/freenode:pw".to_string(),
    });
    state.save(&db).await?;

    let mut restored = ConnectionState::new("rt-3", ConnectionKind::Incoming);
    restored.maybe_load(&db).await?;
    assert_eq!(restored.scratch.capping.as_deref(), Some("302"));
    assert_eq!(restored.scratch.queue.len(), 2);
    assert_eq!(
        restored.scratch.reg.as_ref().map(|r| r.pass.as_str()),
        Some("alice/freenode:pw")
    );
    Ok(())
}

#[tokio::test]
async fn destroy_removes_the_row() -> anyhow::Result<()> {
    let db = Database::new(":memory:").await?;
    let state = populated_state("rt-4");
    state.save(&db).await?;
    state.destroy(&db).await?;

    assert!(db.connections().fetch("rt-4").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn maybe_load_is_idempotent() -> anyhow::Result<()> {
    let db = Database::new(":memory:").await?;
    let original = populated_state("rt-5");
    original.save(&db).await?;

    let mut state = ConnectionState::new("rt-5", ConnectionKind::Outgoing);
    state.maybe_load(&db).await?;
    // A local change must not be clobbered by a second load.
    state.nick = "changed".to_string();
    state.maybe_load(&db).await?;
    assert_eq!(state.nick, "changed");
    Ok(())
}
