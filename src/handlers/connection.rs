//! Connection-lifecycle verbs: PASS, NICK, USER, PING, QUIT, KILL, DEB,
//! RELOAD.
//!
//! PASS/NICK/USER never reach the upstream; the bouncer collects them into
//! the registration scratch and synthesizes its own registration upstream.

use std::sync::Arc;

use async_trait::async_trait;
use tether_proto::{Message, Prefix};
use tracing::{debug, info};

use super::{Context, Flow, Handler, HandlerError, HandlerResult, HandlerTable, write_status};

/// `PASS <user[/network][:password]>`
///
/// The argument is the bouncer's credential triple, not an IRC server
/// password. Ignored once the connection is authenticated.
pub struct PassHandler;

#[async_trait]
impl Handler for PassHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        let pass = msg.arg(0).unwrap_or("").to_string();
        let mut state = ctx.con.state.lock().await;
        if state.auth_user_id != 0 {
            return Ok(Flow::Stop);
        }
        state
            .scratch_update(&ctx.shared.db, |s| {
                if let Some(reg) = &mut s.reg {
                    reg.pass = pass;
                }
            })
            .await?;
        Ok(Flow::Stop)
    }
}

/// `NICK <nick>`
pub struct NickHandler;

#[async_trait]
impl Handler for NickHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        let Some(nick) = msg.arg(0) else {
            return Ok(Flow::Stop);
        };
        let nick = nick.to_string();

        let (net_registered, upstream_id, server_prefix) = {
            let state = ctx.con.state.lock().await;
            (
                state.net_registered,
                state.upstream_con_id.clone(),
                state.server_prefix.clone(),
            )
        };

        if !net_registered {
            {
                let mut state = ctx.con.state.lock().await;
                state.nick = nick.clone();
                state
                    .scratch_update(&ctx.shared.db, |s| {
                        if let Some(reg) = &mut s.reg {
                            reg.nick = nick.clone();
                        }
                    })
                    .await?;
            }

            // Echo the nick back, then make clear a password is needed.
            ctx.con
                .send(
                    Message::new("NICK", vec![nick.clone()]).with_prefix(Prefix::Nickname(
                        nick.clone(),
                        String::new(),
                        String::new(),
                    )),
                )
                .await;
            ctx.con
                .send(Message::numeric(
                    &server_prefix,
                    "464",
                    vec![nick.clone(), "Password required".to_string()],
                ))
                .await;
            ctx.con
                .send(
                    Message::notice(
                        &nick,
                        "You must send your password: /quote PASS <username>/<network>:<password>",
                    )
                    .with_prefix(Prefix::ServerName(server_prefix)),
                )
                .await;
            return Ok(Flow::Stop);
        }

        // A nick change while the upstream is still registering would race
        // the bouncer's own handshake.
        if let Some(upstream_id) = upstream_id
            && let Some(upstream) = ctx.shared.registry.get(&upstream_id)
            && !upstream.state.lock().await.net_registered
        {
            return Ok(Flow::Stop);
        }

        Ok(Flow::Forward)
    }
}

/// `USER <user> <mode> <unused> :<realname>`
///
/// Only the username matters; the bouncer sends its own USER upstream.
pub struct UserHandler;

#[async_trait]
impl Handler for UserHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        let user = msg.arg(0).unwrap_or("").to_string();
        let mut state = ctx.con.state.lock().await;
        if state.scratch.reg.is_some() {
            state
                .scratch_update(&ctx.shared.db, |s| {
                    if let Some(reg) = &mut s.reg {
                        reg.user = user;
                    }
                })
                .await?;
        }
        Ok(Flow::Stop)
    }
}

/// `PING <token>` answered locally; the upstream has its own keepalive.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        let token = msg.arg(0).unwrap_or("");
        ctx.con.send(Message::pong(token)).await;
        Ok(Flow::Stop)
    }
}

/// `QUIT` closes the client; the upstream session stays up for the next
/// attach.
pub struct QuitHandler;

#[async_trait]
impl Handler for QuitHandler {
    async fn handle(&self, ctx: &Context<'_>, _msg: &Message) -> HandlerResult {
        info!(con_id = %ctx.con.con_id, "Client quit");
        Err(HandlerError::Close)
    }
}

/// `KILL` shuts the whole process down. Admin only.
pub struct KillHandler;

#[async_trait]
impl Handler for KillHandler {
    async fn handle(&self, ctx: &Context<'_>, _msg: &Message) -> HandlerResult {
        let admin = { ctx.con.state.lock().await.auth_admin };
        if !admin {
            write_status(ctx.con, "KILL requires admin").await;
            return Ok(Flow::Stop);
        }
        info!(con_id = %ctx.con.con_id, "Shutdown requested via KILL");
        ctx.shared.request_shutdown();
        Ok(Flow::Stop)
    }
}

/// `DEB` logs a state summary for the issuing connection.
pub struct DebHandler;

#[async_trait]
impl Handler for DebHandler {
    async fn handle(&self, ctx: &Context<'_>, _msg: &Message) -> HandlerResult {
        let summary = {
            let state = ctx.con.state.lock().await;
            format!(
                "con={} kind={} registered={} connected={} upstream={:?} buffers={}",
                state.con_id,
                state.kind.as_str(),
                state.net_registered,
                state.connected,
                state.upstream_con_id,
                state.buffers.len(),
            )
        };
        debug!(con_id = %ctx.con.con_id, state = %summary, "DEB");
        write_status(ctx.con, &summary).await;
        Ok(Flow::Stop)
    }
}

/// `RELOAD` rebuilds the verb table, re-registering every command module.
pub struct ReloadHandler;

#[async_trait]
impl Handler for ReloadHandler {
    async fn handle(&self, ctx: &Context<'_>, _msg: &Message) -> HandlerResult {
        *ctx.shared.handlers.write().await = Arc::new(HandlerTable::new());
        info!(con_id = %ctx.con.con_id, "Handler table rebuilt");
        write_status(ctx.con, "Commands reloaded").await;
        Ok(Flow::Stop)
    }
}
