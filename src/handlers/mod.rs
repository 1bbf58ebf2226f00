//! Verb handlers and the downstream dispatch machine.
//!
//! Every line a downstream client sends passes through [`process_line`],
//! which applies three gates in order before any handler runs:
//!
//! 1. unconditional verbs (`DEB`, `RELOAD`, `PING`) always execute
//! 2. while CAP negotiation is open, everything except `CAP` is queued
//! 3. before registration, only `USER`/`NICK`/`PASS`/`CAP` execute
//!
//! Registered traffic dispatches through the [`HandlerTable`]; a verb
//! without a handler forwards upstream verbatim. Handlers signal the
//! dispatcher with [`Flow`]: forward the raw line upstream, or stop here.

mod binder;
mod bouncer;
mod cap;
mod connection;
mod control;
mod messaging;

pub use binder::{bind_upstream, register_client, register_local_client};
pub use bouncer::BouncerHandler;
pub use cap::CapHandler;
pub use connection::{
    DebHandler, KillHandler, NickHandler, PassHandler, PingHandler, QuitHandler, ReloadHandler,
    UserHandler,
};
pub use messaging::{NoticeHandler, PrivmsgHandler};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tether_proto::{Message, Prefix};
use tracing::{debug, warn};

use crate::db::DbError;
use crate::shared::Shared;
use crate::state::{ConnectionHandle, RegAttempt};
use thiserror::Error;

/// What the dispatcher does with the line after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Send the raw line to the bound upstream verbatim.
    Forward,
    /// Terminated locally.
    Stop,
}

/// Where a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgSource {
    /// Read straight off the client socket.
    Socket,
    /// Replayed from the CAP-window queue; bypasses the CAP gate.
    Queue,
}

/// Errors surfaced out of dispatch.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Bad PASS syntax or failed credentials. The connection gets
    /// `ERROR :Invalid password` and is closed.
    #[error("invalid password")]
    InvalidPassword,

    /// Orderly close requested (QUIT). No wire response.
    #[error("connection closed")]
    Close,

    /// Persistence failed; the acknowledgement for the current message
    /// must not be sent.
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

impl HandlerError {
    /// Static label for log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPassword => "invalid_password",
            Self::Close => "close",
            Self::Db(_) => "db_error",
        }
    }
}

/// Result type for verb handlers.
pub type HandlerResult = Result<Flow, HandlerError>;

/// Context handed to each handler invocation.
pub struct Context<'a> {
    pub shared: &'a Arc<Shared>,
    pub con: &'a Arc<ConnectionHandle>,
    pub source: MsgSource,
}

/// A verb handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult;

    /// Capabilities this handler makes available for CAP LS.
    fn available_caps(&self) -> &'static [&'static str] {
        &[]
    }
}

/// The verb dispatch table.
///
/// RELOAD rebuilds the whole table, which is what lets command modules be
/// swapped without tracking individual registrations.
pub struct HandlerTable {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Box<dyn Handler>> = HashMap::new();

        handlers.insert("CAP", Box::new(CapHandler));
        handlers.insert("PASS", Box::new(PassHandler));
        handlers.insert("NICK", Box::new(NickHandler));
        handlers.insert("USER", Box::new(UserHandler));
        handlers.insert("PING", Box::new(PingHandler));
        handlers.insert("QUIT", Box::new(QuitHandler));
        handlers.insert("KILL", Box::new(KillHandler));
        handlers.insert("DEB", Box::new(DebHandler));
        handlers.insert("RELOAD", Box::new(ReloadHandler));
        handlers.insert("PRIVMSG", Box::new(PrivmsgHandler));
        handlers.insert("NOTICE", Box::new(NoticeHandler));
        handlers.insert("BOUNCER", Box::new(BouncerHandler));

        Self { handlers }
    }

    pub fn get(&self, verb: &str) -> Option<&dyn Handler> {
        self.handlers.get(verb).map(Box::as_ref)
    }

    /// Space-joined list of every capability the loaded handlers offer.
    pub fn available_caps(&self) -> Vec<&'static str> {
        let mut caps: Vec<&'static str> = self
            .handlers
            .values()
            .flat_map(|h| h.available_caps().iter().copied())
            .collect();
        caps.sort_unstable();
        caps.dedup();
        caps
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Verbs that execute regardless of CAP or registration state.
const UNCONDITIONAL: &[&str] = &["DEB", "RELOAD", "PING"];

/// Verbs allowed before registration completes.
const PRE_REGISTRATION: &[&str] = &["USER", "NICK", "PASS", "CAP"];

/// Run one downstream line through the gates, dispatch it, and forward it
/// upstream when the handler says so.
pub async fn process_line(
    shared: &Arc<Shared>,
    con: &Arc<ConnectionHandle>,
    line: &str,
    source: MsgSource,
) -> Result<(), HandlerError> {
    let Ok(msg) = line.parse::<Message>() else {
        debug!(con_id = %con.con_id, raw = %line, "Dropping unparseable line");
        return Ok(());
    };
    let verb = msg.verb.clone();
    let ctx = Context {
        shared,
        con,
        source,
    };

    {
        let mut state = con.state.lock().await;
        state.maybe_load(&shared.db).await?;
    }

    // Gate 1: unconditional verbs.
    if UNCONDITIONAL.contains(&verb.as_str()) {
        dispatch(&ctx, &verb, &msg).await?;
        return Ok(());
    }

    // Gate 2: CAP window. Everything except CAP itself is held back in
    // arrival order; queue-sourced lines have already been through here.
    if source != MsgSource::Queue && verb != "CAP" {
        let mut state = con.state.lock().await;
        if state.scratch.capping.is_some() {
            let raw = line.to_string();
            state.scratch_update(&shared.db, |s| s.queue.push(raw)).await?;
            return Ok(());
        }
    }

    // Gate 3: pre-registration allowlist.
    let net_registered = { con.state.lock().await.net_registered };
    if !net_registered {
        if !PRE_REGISTRATION.contains(&verb.as_str()) {
            debug!(con_id = %con.con_id, verb = %verb, "Dropping pre-registration verb");
            return Ok(());
        }
        {
            let mut state = con.state.lock().await;
            if state.scratch.reg.is_none() {
                state.scratch.reg = Some(RegAttempt::default());
            }
        }
        dispatch(&ctx, &verb, &msg).await?;
        maybe_process_registration(shared, con).await?;
        return Ok(());
    }

    // Registered: known verbs decide; unknown verbs forward verbatim.
    let flow = dispatch(&ctx, &verb, &msg).await?;
    if flow == Flow::Forward {
        forward_upstream(shared, con, &msg).await;
    }
    Ok(())
}

/// Look up and invoke the handler for a verb. Unknown verbs forward.
///
/// The table lock is released before the handler runs, so RELOAD can swap
/// the table from inside its own dispatch.
async fn dispatch(ctx: &Context<'_>, verb: &str, msg: &Message) -> HandlerResult {
    let table = { Arc::clone(&*ctx.shared.handlers.read().await) };
    match table.get(verb) {
        Some(handler) => handler.handle(ctx, msg).await,
        None => Ok(Flow::Forward),
    }
}

/// Send a client-origin message to the connection's bound upstream.
pub async fn forward_upstream(shared: &Arc<Shared>, con: &Arc<ConnectionHandle>, msg: &Message) {
    let upstream_id = { con.state.lock().await.upstream_con_id.clone() };
    let Some(upstream_id) = upstream_id else {
        return;
    };
    match shared.registry.get(&upstream_id) {
        Some(upstream) => upstream.send(msg.clone()).await,
        None => debug!(con_id = %con.con_id, upstream = %upstream_id, "Upstream gone, dropping forward"),
    }
}

/// Write a bouncer status line to one client, as PRIVMSG from the
/// configured server prefix.
pub async fn write_status(con: &Arc<ConnectionHandle>, text: &str) {
    let (prefix, nick) = {
        let state = con.state.lock().await;
        (
            state.server_prefix.clone(),
            if state.nick.is_empty() {
                "*".to_string()
            } else {
                state.nick.clone()
            },
        )
    };
    con.send(Message::privmsg(&nick, text).with_prefix(Prefix::ServerName(prefix)))
        .await;
}

/// `user[/network][:password]`
static PASS_TRIPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^/:]+)(?:/([^:]+))?(?::(.*))?$").expect("valid pass regex"));

/// Complete registration once NICK, USER, and PASS have all arrived and
/// the CAP window is closed.
pub async fn maybe_process_registration(
    shared: &Arc<Shared>,
    con: &Arc<ConnectionHandle>,
) -> Result<(), HandlerError> {
    let attempt = {
        let state = con.state.lock().await;
        if state.scratch.capping.is_some() {
            return Ok(());
        }
        match &state.scratch.reg {
            Some(reg) if !reg.nick.is_empty() && !reg.user.is_empty() && !reg.pass.is_empty() => {
                reg.clone()
            }
            _ => return Ok(()),
        }
    };

    let captures = PASS_TRIPLE
        .captures(&attempt.pass)
        .ok_or(HandlerError::InvalidPassword)?;
    let username = captures.get(1).map_or("", |m| m.as_str());
    let network_name = captures.get(2).map_or("", |m| m.as_str());
    let password = captures.get(3).map_or("", |m| m.as_str());

    let users = shared.db.users();

    if !network_name.is_empty() {
        let network = users
            .auth_user_network(username, password, network_name)
            .await?
            .ok_or(HandlerError::InvalidPassword)?;
        let admin = users
            .get_user(network.user_id)
            .await?
            .map(|u| u.admin)
            .unwrap_or(false);

        {
            let mut state = con.state.lock().await;
            state.auth_user_id = network.user_id;
            state.auth_network_id = network.id;
            state.auth_network_name = network.name.clone();
            state.auth_admin = admin;
            state.net_registered = true;
            state.save(&shared.db).await?;
        }
        debug!(con_id = %con.con_id, user_id = network.user_id, network = %network.name, "Client authenticated");

        bind_upstream(shared, con, &network).await?;
    } else {
        let user = users
            .auth_user(username, password)
            .await?
            .ok_or(HandlerError::InvalidPassword)?;

        {
            let mut state = con.state.lock().await;
            state.auth_user_id = user.id;
            state.auth_admin = user.admin;
            state.net_registered = true;
            state.save(&shared.db).await?;
        }
        debug!(con_id = %con.con_id, user_id = user.id, "Client authenticated (no network)");

        register_local_client(shared, con).await?;
        write_status(con, "Welcome to your BNC!").await;
    }

    let mut state = con.state.lock().await;
    if let Err(e) = state.scratch_update(&shared.db, |s| s.reg = None).await {
        warn!(con_id = %con.con_id, error = %e, "Failed to clear registration scratch");
        return Err(e.into());
    }
    Ok(())
}
