//! The `*bnc` control target.
//!
//! An authenticated client can PRIVMSG `*bnc` to talk to the bouncer
//! itself; replies come back as status lines. The heavier administrative
//! surface lives on the BOUNCER verb, so this stays a thin help shim.

use super::{Context, HandlerError, write_status};

pub async fn handle(ctx: &Context<'_>, text: &str) -> Result<(), HandlerError> {
    let mut words = text.split_whitespace();
    match words.next().map(str::to_ascii_lowercase).as_deref() {
        None | Some("help") => {
            write_status(ctx.con, "Commands: help, networks").await;
            write_status(
                ctx.con,
                "Network management: BOUNCER CONNECT|DISCONNECT|LISTNETWORKS|LISTBUFFERS|DELBUFFER",
            )
            .await;
        }
        Some("networks") => {
            let user_id = { ctx.con.state.lock().await.auth_user_id };
            let networks = ctx.shared.db.users().get_user_networks(user_id).await?;
            if networks.is_empty() {
                write_status(ctx.con, "No networks configured").await;
            }
            for network in networks {
                let line = format!("{} ({}:{})", network.name, network.host, network.port);
                write_status(ctx.con, &line).await;
            }
        }
        Some(other) => {
            let line = format!("Unknown command: {other}. Try: help");
            write_status(ctx.con, &line).await;
        }
    }
    Ok(())
}
