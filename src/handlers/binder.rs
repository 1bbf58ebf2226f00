//! Binding an authenticated downstream to its upstream.
//!
//! After a network-scoped login the client is attached to the single
//! upstream for its `(user, network)` pair: an existing registered session
//! gets its registration burst replayed immediately, an existing
//! disconnected one is redialed, and a missing one is created. The
//! client's upstream pointer and the upstream's linked-client set are
//! always written together.

use std::sync::Arc;

use tether_proto::{Message, Prefix};
use tracing::debug;

use super::{HandlerError, write_status};
use crate::db::Network;
use crate::network::upstream;
use crate::shared::Shared;
use crate::state::ConnectionHandle;

/// Attach `con` to the upstream for `network`, creating or reopening the
/// upstream as needed.
pub async fn bind_upstream(
    shared: &Arc<Shared>,
    con: &Arc<ConnectionHandle>,
    network: &Network,
) -> Result<(), HandlerError> {
    let existing = shared
        .registry
        .find_users_outgoing_connection(network.user_id, network.id);

    let upstream = match existing {
        Some(upstream) => {
            let (connected, registered) = {
                let state = upstream.state.lock().await;
                (state.connected, state.net_registered)
            };
            if connected {
                write_status(con, "Attaching you to the network").await;
                if registered {
                    register_client(con, &upstream).await;
                }
            } else {
                write_status(con, "Connecting to the network..").await;
                upstream::open(&upstream);
            }
            upstream
        }
        None => {
            write_status(con, "Connecting to the network..").await;
            upstream::make_upstream(shared, network).await?
        }
    };

    {
        let mut state = con.state.lock().await;
        state.upstream_con_id = Some(upstream.con_id.clone());
        state.save(&shared.db).await?;
    }
    upstream
        .state
        .lock()
        .await
        .link_incoming_connection(&shared.db, &con.con_id)
        .await?;

    debug!(con_id = %con.con_id, upstream = %upstream.con_id, "Client linked to upstream");
    Ok(())
}

/// Replay a registered upstream's view to one client: the captured
/// registration burst, then JOIN and topic for every joined channel.
pub async fn register_client(con: &Arc<ConnectionHandle>, upstream: &Arc<ConnectionHandle>) {
    let (lines, nick) = {
        let state = upstream.state.lock().await;
        (state.registration_lines.clone(), state.nick.clone())
    };
    for line in &lines {
        if let Ok(msg) = line.parse::<Message>() {
            con.send(msg).await;
        }
    }

    let mut joined: Vec<(String, String)> = {
        let state = upstream.state.lock().await;
        state
            .buffers
            .values()
            .filter(|b| b.joined && b.is_channel)
            .map(|b| (b.name.clone(), b.topic.clone()))
            .collect()
    };
    joined.sort();

    let server_prefix = { con.state.lock().await.server_prefix.clone() };
    for (channel, topic) in joined {
        con.send(
            Message::new("JOIN", vec![channel.clone()]).with_prefix(Prefix::Nickname(
                nick.clone(),
                String::new(),
                String::new(),
            )),
        )
        .await;
        if !topic.is_empty() {
            con.send(Message::numeric(
                &server_prefix,
                "332",
                vec![nick.clone(), channel, topic],
            ))
            .await;
        }
    }

    {
        let mut state = con.state.lock().await;
        if state.nick.is_empty() {
            state.nick = nick;
        }
    }
}

/// Welcome burst for a user-only login, where there is no upstream to
/// replay. The bouncer speaks for itself with a minimal 001..376.
pub async fn register_local_client(
    shared: &Arc<Shared>,
    con: &Arc<ConnectionHandle>,
) -> Result<(), HandlerError> {
    let (prefix, nick) = {
        let state = con.state.lock().await;
        (state.server_prefix.clone(), state.nick.clone())
    };

    let burst: [(&str, Vec<String>); 6] = [
        (
            "001",
            vec![nick.clone(), format!("Welcome to your BNC, {nick}")],
        ),
        (
            "002",
            vec![nick.clone(), format!("Your host is {prefix}")],
        ),
        ("003", vec![nick.clone(), "This server has been running since you connected".to_string()]),
        (
            "375",
            vec![nick.clone(), format!("- {prefix} Message of the Day -")],
        ),
        (
            "372",
            vec![
                nick.clone(),
                "- Log in with user/network to attach to an IRC network".to_string(),
            ],
        ),
        ("376", vec![nick.clone(), "End of /MOTD command.".to_string()]),
    ];
    for (code, params) in burst {
        con.send(Message::numeric(&prefix, code, params)).await;
    }

    con.state.lock().await.save(&shared.db).await?;
    Ok(())
}
