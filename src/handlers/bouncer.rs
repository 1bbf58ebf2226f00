//! The BOUNCER administrative verb.
//!
//! Sub-commands manage the issuing user's networks and buffers:
//! CONNECT, DISCONNECT, LISTNETWORKS, LISTBUFFERS, DELBUFFER. Argument
//! errors answer with the literal `ERR_INVALIDARGS` / `ERR_NETNOTFOUND`
//! tokens and leave the connection open; completed commands answer
//! `RPL_OK`.

use async_trait::async_trait;
use tether_proto::tags::encode_tag_pairs;
use tether_proto::{Message, Prefix};
use tracing::info;

use super::{Context, Flow, Handler, HandlerResult};
use crate::db::Network;
use crate::network::upstream;
use crate::state::{Buffer, ConnectionKind, ConnectionState};

pub struct BouncerHandler;

#[async_trait]
impl Handler for BouncerHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        let sub = msg.arg(0).unwrap_or("").to_ascii_uppercase();
        match sub.as_str() {
            "CONNECT" => connect(ctx, msg.arg(1)).await,
            "DISCONNECT" => disconnect(ctx, msg.arg(1)).await,
            "LISTNETWORKS" => list_networks(ctx).await,
            "LISTBUFFERS" => list_buffers(ctx, msg.arg(1)).await,
            "DELBUFFER" => del_buffer(ctx, msg.arg(1), msg.arg(2)).await,
            _ => {
                reply(ctx, &[&sub.to_ascii_lowercase(), "ERR_INVALIDARGS"]).await;
                Ok(Flow::Stop)
            }
        }
    }

    fn available_caps(&self) -> &'static [&'static str] {
        &["bouncer"]
    }
}

async fn connect(ctx: &Context<'_>, name: Option<&str>) -> HandlerResult {
    let Some(network) = resolve_network(ctx, "connect", name).await? else {
        return Ok(Flow::Stop);
    };

    match ctx
        .shared
        .registry
        .find_users_outgoing_connection(network.user_id, network.id)
    {
        Some(existing) => {
            let connected = { existing.state.lock().await.connected };
            if !connected {
                info!(network = %network.name, "BOUNCER CONNECT reopening upstream");
                upstream::open(&existing);
            }
        }
        None => {
            info!(network = %network.name, "BOUNCER CONNECT creating upstream");
            upstream::make_upstream(ctx.shared, &network).await?;
        }
    }
    Ok(Flow::Stop)
}

async fn disconnect(ctx: &Context<'_>, name: Option<&str>) -> HandlerResult {
    let Some(network) = resolve_network(ctx, "disconnect", name).await? else {
        return Ok(Flow::Stop);
    };

    if let Some(existing) = ctx
        .shared
        .registry
        .find_users_outgoing_connection(network.user_id, network.id)
        && existing.state.lock().await.connected
    {
        info!(network = %network.name, "BOUNCER DISCONNECT closing upstream");
        existing.close.notify_one();
    }
    Ok(Flow::Stop)
}

async fn list_networks(ctx: &Context<'_>) -> HandlerResult {
    let user_id = { ctx.con.state.lock().await.auth_user_id };
    let networks = ctx.shared.db.users().get_user_networks(user_id).await?;

    for network in networks {
        let state = match ctx
            .shared
            .registry
            .find_users_outgoing_connection(network.user_id, network.id)
        {
            Some(up) => {
                if up.state.lock().await.connected {
                    "connected"
                } else {
                    // A session exists but its transport is down.
                    "disconnect"
                }
            }
            None => "disconnected",
        };
        let port = network.port.to_string();
        let pairs = encode_tag_pairs([
            ("network", network.name.as_str()),
            ("host", network.host.as_str()),
            ("port", port.as_str()),
            ("tls", if network.tls { "1" } else { "0" }),
            ("state", state),
        ]);
        reply(ctx, &["listnetworks", &pairs]).await;
    }

    // Terminator verb is singular in the original protocol.
    reply(ctx, &["listnetwork", "RPL_OK"]).await;
    Ok(Flow::Stop)
}

async fn list_buffers(ctx: &Context<'_>, name: Option<&str>) -> HandlerResult {
    let Some(network) = resolve_network(ctx, "listbuffers", name).await? else {
        return Ok(Flow::Stop);
    };

    let mut buffers = upstream_buffers(ctx, &network).await?;
    buffers.sort_by(|a, b| a.name.cmp(&b.name));

    for buffer in buffers {
        let pairs = encode_tag_pairs([
            ("network", network.name.as_str()),
            ("buffer", buffer.name.as_str()),
            ("joined", if buffer.joined { "1" } else { "0" }),
            ("topic", buffer.topic.as_str()),
        ]);
        reply(ctx, &["listbuffers", &network.name, &pairs]).await;
    }

    reply(ctx, &["listbuffers", &network.name, "RPL_OK"]).await;
    Ok(Flow::Stop)
}

async fn del_buffer(
    ctx: &Context<'_>,
    name: Option<&str>,
    buffer_name: Option<&str>,
) -> HandlerResult {
    let Some(network) = resolve_network(ctx, "delbuffer", name).await? else {
        return Ok(Flow::Stop);
    };
    let Some(buffer_name) = buffer_name else {
        reply(ctx, &["delbuffer", "ERR_INVALIDARGS"]).await;
        return Ok(Flow::Stop);
    };

    let live = ctx
        .shared
        .registry
        .find_users_outgoing_connection(network.user_id, network.id);

    match live {
        Some(up) => {
            let removed = {
                let mut state = up.state.lock().await;
                let removed = state.del_buffer(buffer_name);
                if removed.is_some() {
                    state.save(&ctx.shared.db).await?;
                }
                removed
            };
            if let Some(buffer) = removed
                && buffer.joined
                && buffer.is_channel
            {
                up.send(Message::new("PART", vec![buffer.name.clone()])).await;
            }
        }
        None => {
            // Mutate the persisted record directly; the session is down.
            let mut state = ConnectionState::new(
                &ConnectionState::outgoing_con_id(network.user_id, network.id),
                ConnectionKind::Outgoing,
            );
            state.load(&ctx.shared.db).await?;
            if state.del_buffer(buffer_name).is_some() {
                state.save(&ctx.shared.db).await?;
            }
        }
    }

    reply(ctx, &["delbuffer", &network.name, buffer_name, "RPL_OK"]).await;
    Ok(Flow::Stop)
}

/// Look up `name` among the issuing user's networks, answering the error
/// tokens on a missing argument or unknown network.
async fn resolve_network(
    ctx: &Context<'_>,
    sub: &str,
    name: Option<&str>,
) -> Result<Option<Network>, super::HandlerError> {
    let Some(name) = name else {
        reply(ctx, &[sub, "ERR_INVALIDARGS"]).await;
        return Ok(None);
    };
    let user_id = { ctx.con.state.lock().await.auth_user_id };
    match ctx
        .shared
        .db
        .users()
        .get_network_by_name(user_id, name)
        .await?
    {
        Some(network) => Ok(Some(network)),
        None => {
            reply(ctx, &[sub, "ERR_NETNOTFOUND"]).await;
            Ok(None)
        }
    }
}

/// Buffers for a network: the live upstream's when one exists, otherwise
/// whatever the persisted record holds.
async fn upstream_buffers(
    ctx: &Context<'_>,
    network: &Network,
) -> Result<Vec<Buffer>, super::HandlerError> {
    if let Some(up) = ctx
        .shared
        .registry
        .find_users_outgoing_connection(network.user_id, network.id)
    {
        let state = up.state.lock().await;
        return Ok(state.buffers.values().cloned().collect());
    }

    let mut state = ConnectionState::new(
        &ConnectionState::outgoing_con_id(network.user_id, network.id),
        ConnectionKind::Outgoing,
    );
    state.load(&ctx.shared.db).await?;
    Ok(state.buffers.values().cloned().collect())
}

/// `BOUNCER <args...>` from the bouncer's prefix.
async fn reply(ctx: &Context<'_>, args: &[&str]) {
    let prefix = { ctx.con.state.lock().await.server_prefix.clone() };
    let params = args.iter().map(|s| s.to_string()).collect();
    ctx.con
        .send(Message::new("BOUNCER", params).with_prefix(Prefix::ServerName(prefix)))
        .await;
}
