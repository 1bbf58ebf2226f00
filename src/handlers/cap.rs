//! CAP negotiation (IRCv3 capability-negotiation 3.1/3.2).
//!
//! Opening the LS..END window sets the `capping` scratch marker, which
//! makes the dispatcher queue every non-CAP line until END. END drains
//! that queue in arrival order before the marker clears, so commands a
//! client pipelined during negotiation land exactly once, in order.

use async_trait::async_trait;
use tether_proto::{Message, Prefix};
use tracing::debug;

use super::{Context, Flow, Handler, HandlerResult, MsgSource, process_line};

pub struct CapHandler;

#[async_trait]
impl Handler for CapHandler {
    async fn handle(&self, ctx: &Context<'_>, msg: &Message) -> HandlerResult {
        let sub = msg.arg(0).unwrap_or("").to_ascii_uppercase();
        match sub.as_str() {
            "LS" => ls(ctx, msg.arg(1)).await,
            "LIST" => list(ctx).await,
            "REQ" => req(ctx, msg.arg(1).unwrap_or("")).await,
            "END" => end(ctx).await,
            _ => {
                debug!(subcommand = %sub, "Ignoring CAP subcommand");
                Ok(Flow::Stop)
            }
        }
    }

    fn available_caps(&self) -> &'static [&'static str] {
        &["cap-notify"]
    }
}

/// `CAP LS [version]` opens the negotiation window and lists what the
/// loaded handlers offer.
async fn ls(ctx: &Context<'_>, version: Option<&str>) -> HandlerResult {
    let version = version.unwrap_or("301").to_string();
    {
        let mut state = ctx.con.state.lock().await;
        state
            .scratch_update(&ctx.shared.db, |s| s.capping = Some(version))
            .await?;
    }

    let caps = {
        let table = ctx.shared.handlers.read().await;
        table.available_caps().join(" ")
    };
    reply(ctx, "LS", &caps).await;
    Ok(Flow::Stop)
}

/// `CAP LIST` reports what this connection has enabled.
async fn list(ctx: &Context<'_>) -> HandlerResult {
    let enabled = {
        let state = ctx.con.state.lock().await;
        let mut caps: Vec<&String> = state.caps.iter().collect();
        caps.sort();
        caps.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
    };
    reply(ctx, "LIST", &enabled).await;
    Ok(Flow::Stop)
}

/// `CAP REQ :<caps>` enables the intersection of the request with what is
/// available, and acknowledges exactly that subset.
async fn req(ctx: &Context<'_>, requested: &str) -> HandlerResult {
    let available = {
        let table = ctx.shared.handlers.read().await;
        table.available_caps()
    };

    let matched: Vec<&str> = requested
        .split_whitespace()
        .filter(|cap| available.contains(cap))
        .collect();

    {
        let mut state = ctx.con.state.lock().await;
        for cap in &matched {
            state.caps.insert((*cap).to_string());
        }
        state.save(&ctx.shared.db).await?;
    }

    reply(ctx, "ACK", &matched.join(" ")).await;
    Ok(Flow::Stop)
}

/// `CAP END` replays the held-back lines, then closes the window.
async fn end(ctx: &Context<'_>) -> HandlerResult {
    loop {
        let batch = {
            let mut state = ctx.con.state.lock().await;
            if state.scratch.queue.is_empty() {
                break;
            }
            let batch = std::mem::take(&mut state.scratch.queue);
            state.save(&ctx.shared.db).await?;
            batch
        };
        debug!(con_id = %ctx.con.con_id, lines = batch.len(), "Draining CAP queue");
        for line in batch {
            process_line(ctx.shared, ctx.con, &line, MsgSource::Queue).await?;
        }
    }

    let mut state = ctx.con.state.lock().await;
    state
        .scratch_update(&ctx.shared.db, |s| s.capping = None)
        .await?;
    Ok(Flow::Stop)
}

/// `CAP * <sub> :<payload>` from the bouncer's prefix.
async fn reply(ctx: &Context<'_>, sub: &str, payload: &str) {
    let prefix = { ctx.con.state.lock().await.server_prefix.clone() };
    ctx.con
        .send(
            Message::new(
                "CAP",
                vec!["*".to_string(), sub.to_string(), payload.to_string()],
            )
            .with_prefix(Prefix::ServerName(prefix)),
        )
        .await;
}
