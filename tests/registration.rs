//! Downstream registration: CAP negotiation, the password triple, and the
//! pre-registration gates.

mod common;

use common::{TestHarness, status_texts};
use tetherd::handlers::HandlerError;

#[tokio::test]
async fn registration_happy_path() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let (user_id, network_id) = harness
        .seed_user_network("reg_alice", "s3cret", "freenode")
        .await?;

    let mut client = harness.client().await;
    harness.send(&client, "CAP LS 302").await?;
    harness.send(&client, "NICK bob").await?;
    harness.send(&client, "USER bob 0 * :Bob").await?;
    harness.send(&client, "PASS reg_alice/freenode:s3cret").await?;

    // Everything after CAP LS is still queued.
    {
        let state = client.handle.state.lock().await;
        assert_eq!(state.scratch.capping.as_deref(), Some("302"));
        assert_eq!(state.scratch.queue.len(), 3);
        assert!(!state.net_registered);
    }

    harness.send(&client, "CAP END").await?;

    let state = client.handle.state.lock().await;
    assert!(state.scratch.queue.is_empty());
    assert!(state.scratch.capping.is_none());
    assert!(state.scratch.reg.is_none());
    assert!(state.net_registered);
    assert_eq!(state.auth_user_id, user_id);
    assert_eq!(state.auth_network_id, network_id);
    drop(state);

    // The binder created the upstream for the pair and said so.
    assert!(
        harness
            .shared
            .registry
            .find_users_outgoing_connection(user_id, network_id)
            .is_some()
    );
    let messages = client.drain();
    assert!(
        status_texts(&messages)
            .iter()
            .any(|t| t == "Connecting to the network..")
    );

    Ok(())
}

#[tokio::test]
async fn cap_ls_replies_with_available_caps() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let mut client = harness.client().await;

    harness.send(&client, "CAP LS 302").await?;
    let ls = client.find_verb("CAP").expect("CAP LS reply");
    assert_eq!(ls.arg(0), Some("*"));
    assert_eq!(ls.arg(1), Some("LS"));
    let caps = ls.arg(2).unwrap_or("");
    assert!(caps.contains("bouncer"));

    // REQ enables only the intersection.
    harness.send(&client, "CAP REQ :bouncer sasl").await?;
    let ack = client.find_verb("CAP").expect("CAP ACK reply");
    assert_eq!(ack.arg(1), Some("ACK"));
    assert_eq!(ack.arg(2), Some("bouncer"));
    {
        let state = client.handle.state.lock().await;
        assert!(state.caps.contains("bouncer"));
        assert!(!state.caps.contains("sasl"));
    }

    harness.send(&client, "CAP LIST").await?;
    let list = client.find_verb("CAP").expect("CAP LIST reply");
    assert_eq!(list.arg(1), Some("LIST"));
    assert_eq!(list.arg(2), Some("bouncer"));

    Ok(())
}

#[tokio::test]
async fn lines_queued_during_cap_are_replayed_then_gated() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let mut client = harness.client().await;

    harness.send(&client, "CAP LS 302").await?;
    harness.send(&client, "JOIN #foo").await?;

    {
        let state = client.handle.state.lock().await;
        assert_eq!(state.scratch.queue, vec!["JOIN #foo".to_string()]);
    }

    harness.send(&client, "CAP END").await?;

    // The JOIN was replayed but fell to the pre-registration gate; nothing
    // about it reached the client or any upstream.
    let state = client.handle.state.lock().await;
    assert!(state.scratch.queue.is_empty());
    assert!(!state.net_registered);
    assert!(state.buffers.is_empty());
    drop(state);
    assert!(client.drain().iter().all(|m| m.verb != "JOIN"));

    Ok(())
}

#[tokio::test]
async fn ping_is_answered_during_cap_window() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let mut client = harness.client().await;

    harness.send(&client, "CAP LS 302").await?;
    harness.send(&client, "PING :token123").await?;

    let pong = client.find_verb("PONG").expect("PONG while capping");
    assert_eq!(pong.arg(0), Some("token123"));

    // And it was not queued.
    let state = client.handle.state.lock().await;
    assert!(state.scratch.queue.is_empty());

    Ok(())
}

#[tokio::test]
async fn bad_password_closes_with_error() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let client = harness.client().await;

    harness.send(&client, "PASS xxx").await?;
    harness.send(&client, "NICK n").await?;
    let result = harness.send(&client, "USER u 0 * :U").await;

    assert!(matches!(result, Err(HandlerError::InvalidPassword)));
    Ok(())
}

#[tokio::test]
async fn wrong_network_password_is_rejected() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    harness
        .seed_user_network("reg_carol", "right", "efnet")
        .await?;
    let client = harness.client().await;

    harness.send(&client, "NICK carol").await?;
    harness.send(&client, "USER carol 0 * :C").await?;
    let result = harness.send(&client, "PASS reg_carol/efnet:wrong").await;

    assert!(matches!(result, Err(HandlerError::InvalidPassword)));
    Ok(())
}

#[tokio::test]
async fn user_only_login_gets_local_welcome() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let users = harness.shared.db.users();
    users.create_user("reg_dave", "pw").await?;

    let mut client = harness.client().await;
    harness.send(&client, "NICK dave").await?;
    harness.send(&client, "USER dave 0 * :D").await?;
    harness.send(&client, "PASS reg_dave:pw").await?;

    let state = client.handle.state.lock().await;
    assert!(state.net_registered);
    assert!(state.upstream_con_id.is_none());
    drop(state);

    let messages = client.drain();
    assert!(messages.iter().any(|m| m.verb == "001"));
    assert!(messages.iter().any(|m| m.verb == "376"));
    assert!(
        status_texts(&messages)
            .iter()
            .any(|t| t == "Welcome to your BNC!")
    );

    Ok(())
}

#[tokio::test]
async fn nick_before_auth_gets_464() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let mut client = harness.client().await;

    harness.send(&client, "NICK eve").await?;

    let messages = client.drain();
    let echo = messages
        .iter()
        .find(|m| m.verb == "NICK")
        .expect("nick echo");
    assert_eq!(echo.arg(0), Some("eve"));
    let numeric = messages.iter().find(|m| m.verb == "464").expect("464");
    assert_eq!(numeric.arg(1), Some("Password required"));
    assert!(messages.iter().any(|m| m.verb == "NOTICE"));

    let state = client.handle.state.lock().await;
    assert_eq!(
        state.scratch.reg.as_ref().map(|r| r.nick.clone()),
        Some("eve".to_string())
    );

    Ok(())
}

#[tokio::test]
async fn attach_to_registered_upstream_replays_burst() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let (user_id, network_id) = harness
        .seed_user_network("reg_fred", "pw", "freenode")
        .await?;
    let upstream = harness.fake_upstream(user_id, network_id, "freenode").await;
    {
        let mut state = upstream.handle.state.lock().await;
        state
            .registration_lines
            .push(":irc.example.net 001 alice :Welcome to ExampleNet".to_string());
        state
            .registration_lines
            .push(":irc.example.net 376 alice :End of /MOTD command.".to_string());
        let chan = state.add_buffer(tetherd::state::Buffer::new("#rust", true));
        chan.joined = true;
        chan.topic = "ask, don't ask to ask".to_string();
    }

    let mut client = harness.client().await;
    harness.send(&client, "NICK bob").await?;
    harness.send(&client, "USER bob 0 * :Bob").await?;
    harness.send(&client, "PASS reg_fred/freenode:pw").await?;

    {
        let state = client.handle.state.lock().await;
        assert!(state.net_registered);
        assert_eq!(
            state.upstream_con_id.as_deref(),
            Some(upstream.handle.con_id.as_str())
        );
    }
    {
        let state = upstream.handle.state.lock().await;
        assert!(
            state
                .linked_incoming_con_ids
                .contains(&client.handle.con_id)
        );
    }

    let messages = client.drain();
    assert!(
        status_texts(&messages)
            .iter()
            .any(|t| t == "Attaching you to the network")
    );
    assert!(messages.iter().any(|m| m.verb == "001"));
    assert!(messages.iter().any(|m| m.verb == "376"));
    let join = messages
        .iter()
        .find(|m| m.verb == "JOIN")
        .expect("replayed JOIN");
    assert_eq!(join.arg(0), Some("#rust"));
    assert_eq!(join.prefix.as_ref().and_then(|p| p.nick()), Some("alice"));
    let topic = messages.iter().find(|m| m.verb == "332").expect("topic");
    assert_eq!(topic.arg(2), Some("ask, don't ask to ask"));

    Ok(())
}

#[tokio::test]
async fn forbidden_verbs_are_dropped_pre_registration() -> anyhow::Result<()> {
    let harness = TestHarness::new().await?;
    let mut client = harness.client().await;

    harness.send(&client, "JOIN #secret").await?;
    harness.send(&client, "PRIVMSG #secret :hello").await?;

    // Silently dropped: no error reply, no state change.
    assert!(client.drain().is_empty());
    let state = client.handle.state.lock().await;
    assert!(state.buffers.is_empty());

    Ok(())
}
