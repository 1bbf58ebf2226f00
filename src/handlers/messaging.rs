//! PRIVMSG and NOTICE: fan-out, logging, and upstream forwarding.
//!
//! A message the user sends from one client is echoed to every sibling
//! client attached to the same upstream, prefixed with the upstream's
//! current nick, so all attached clients render the conversation the same
//! way. The original line still goes upstream verbatim.

use async_trait::async_trait;
use tether_proto::{Message, Prefix, irc_eq};
use tracing::warn;

use super::{Context, Flow, Handler, HandlerResult, control};
use crate::db::LoggedMessage;

pub struct PrivmsgHandler;

#[async_trait]
impl Handler for PrivmsgHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        relay(ctx, msg, "PRIVMSG").await
    }
}

pub struct NoticeHandler;

#[async_trait]
impl Handler for NoticeHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        relay(ctx, msg, "NOTICE").await
    }
}

async fn relay(ctx: &Context<'_>, msg: &Message, command: &str) -> HandlerResult {
    let Some(target) = msg.arg(0) else {
        return Ok(Flow::Stop);
    };
    let text = msg.arg(1).unwrap_or("");

    // The bouncer's own control channel; never forwarded.
    if command == "PRIVMSG" && irc_eq(target, "*bnc") {
        let authed = { ctx.con.state.lock().await.auth_user_id != 0 };
        if authed {
            control::handle(ctx, text).await?;
            return Ok(Flow::Stop);
        }
    }

    let (upstream_id, user_id, network_id) = {
        let state = ctx.con.state.lock().await;
        (
            state.upstream_con_id.clone(),
            state.auth_user_id,
            state.auth_network_id,
        )
    };

    // No upstream bound (user-only session): nowhere to send it.
    let Some(upstream_id) = upstream_id else {
        return Ok(Flow::Stop);
    };
    let Some(upstream) = ctx.shared.registry.get(&upstream_id) else {
        warn!(con_id = %ctx.con.con_id, upstream = %upstream_id, "Upstream missing during relay");
        return Ok(Flow::Stop);
    };

    let (nick, logging) = {
        let state = upstream.state.lock().await;
        (state.nick.clone(), state.logging)
    };

    let echo = Message::new(command, vec![target.to_string(), text.to_string()]).with_prefix(
        Prefix::Nickname(nick.clone(), String::new(), String::new()),
    );
    for sibling in ctx
        .shared
        .registry
        .linked_clients(&upstream, Some(&ctx.con.con_id))
        .await
    {
        sibling.send(echo.clone()).await;
    }

    if logging {
        let logged = LoggedMessage {
            command: command.to_string(),
            prefix: nick,
            target: target.to_string(),
            text: text.to_string(),
        };
        ctx.shared
            .db
            .history()
            .store(user_id, network_id, &logged)
            .await?;
    }

    Ok(Flow::Forward)
}
