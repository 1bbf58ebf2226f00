//! Upstream sessions: the bouncer's own connections to IRC networks.
//!
//! Each outgoing record gets one long-lived session task that owns the
//! outbound queue for the whole life of the record, across any number of
//! dials. The task idles while disconnected (dropping queued forwards),
//! dials when `open` is signalled, and never reconnects on its own: a
//! dropped link stays down until a client attaches or BOUNCER CONNECT
//! asks for it.
//!
//! While connected the task is the sole writer of the record's state:
//! registration-burst capture, ISUPPORT collection, buffer tracking, and
//! the MOTD terminus that flips `net_registered` all happen here.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tether_proto::{LineCodec, Message, Prefix, ProtocolError, isupport};

use crate::db::{DbError, Network, SaslCredentials};
use crate::handlers::{self, HandlerError};
use crate::network::tls;
use crate::shared::Shared;
use crate::state::{ConnectionHandle, ConnectionKind, ConnectionState};

/// Create the upstream record for a network, hydrate it from persistence,
/// start its session task, and ask it to dial.
pub async fn make_upstream(
    shared: &Arc<Shared>,
    network: &Network,
) -> Result<Arc<ConnectionHandle>, HandlerError> {
    let con_id = ConnectionState::outgoing_con_id(network.user_id, network.id);
    let (tx, rx) = mpsc::channel(256);
    let handle = ConnectionHandle::new(&con_id, ConnectionKind::Outgoing, tx);

    {
        let mut state = handle.state.lock().await;
        state.server_prefix = shared.config.server.prefix.clone();
        state.auth_user_id = network.user_id;
        state.auth_network_id = network.id;
        state.auth_network_name = network.name.clone();
        state.maybe_load(&shared.db).await.map_err(HandlerError::Db)?;
        // A crashed process can leave connected=true in the row.
        state.connected = false;
        state.net_registered = false;
        state.auth_user_id = network.user_id;
        state.auth_network_id = network.id;
        state.load_connection_info(&shared.db).await.map_err(HandlerError::Db)?;
        state.save(&shared.db).await.map_err(HandlerError::Db)?;
    }

    shared.registry.insert(Arc::clone(&handle));
    tokio::spawn(session_task(Arc::clone(shared), Arc::clone(&handle), rx));
    handle.open.notify_one();

    info!(con_id = %con_id, network = %network.name, "Upstream created");
    Ok(handle)
}

/// Ask an existing upstream's session task to (re)dial.
pub fn open(upstream: &ConnectionHandle) {
    upstream.open.notify_one();
}

/// Boot-time resume: restart the session for every persisted outgoing
/// record whose network still exists.
pub async fn resume_upstreams(shared: &Arc<Shared>) -> Result<(), DbError> {
    let rows = shared.db.connections().all_outgoing().await?;
    for row in rows {
        match shared.db.users().get_network(row.auth_network_id).await? {
            Some(network) => {
                if shared
                    .registry
                    .find_users_outgoing_connection(network.user_id, network.id)
                    .is_none()
                {
                    info!(network = %network.name, "Resuming upstream from persisted record");
                    if let Err(e) = make_upstream(shared, &network).await {
                        warn!(network = %network.name, error = %e, "Failed to resume upstream");
                    }
                }
            }
            None => {
                // The network was deleted while we were down.
                debug!(conid = %row.conid, "Dropping orphaned outgoing record");
                shared.db.connections().delete(&row.conid).await?;
            }
        }
    }
    Ok(())
}

/// The per-record session task.
async fn session_task(
    shared: Arc<Shared>,
    handle: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<Message>,
) {
    let mut shutdown = shared.shutdown_signal();
    loop {
        tokio::select! {
            _ = handle.open.notified() => {
                if let Err(e) = run_connected(&shared, &handle, &mut rx).await {
                    warn!(con_id = %handle.con_id, error = %e, "Upstream session error");
                }
            }
            Some(msg) = rx.recv() => {
                debug!(con_id = %handle.con_id, verb = %msg.verb, "Dropping forward while disconnected");
            }
            _ = handle.close.notified() => {}
            _ = shutdown.changed() => return,
        }
    }
}

enum Transport {
    Plain(Framed<TcpStream, LineCodec>),
    Tls(Box<Framed<TlsStream<TcpStream>, LineCodec>>),
}

impl Transport {
    async fn send_line(&mut self, line: String) -> Result<(), ProtocolError> {
        match self {
            Transport::Plain(framed) => framed.send(line).await,
            Transport::Tls(framed) => framed.send(line).await,
        }
    }

    async fn next_line(&mut self) -> Option<Result<String, ProtocolError>> {
        match self {
            Transport::Plain(framed) => framed.next().await,
            Transport::Tls(framed) => framed.next().await,
        }
    }
}

/// SASL PLAIN progress during the upstream handshake.
enum SaslPhase {
    /// Not doing SASL on this dial.
    Disabled,
    /// CAP LS sent, waiting for the server's cap list.
    WantCaps(SaslCredentials),
    /// CAP REQ :sasl sent.
    WantAck(SaslCredentials),
    /// AUTHENTICATE PLAIN sent, waiting for the `+` challenge.
    WantChallenge(SaslCredentials),
    /// Credentials sent, waiting for 903/904.
    WantResult,
    Done,
}

/// One dial: connect, register, pump until the link drops or close is
/// signalled.
async fn run_connected(
    shared: &Arc<Shared>,
    handle: &Arc<ConnectionHandle>,
    rx: &mut mpsc::Receiver<Message>,
) -> Result<(), DbError> {
    // Refresh transport parameters from the store on every dial.
    let params = {
        let mut state = handle.state.lock().await;
        state.load_connection_info(&shared.db).await?;
        if state.host.is_empty() {
            warn!(con_id = %handle.con_id, "No host configured, not dialing");
            return Ok(());
        }
        (
            state.host.clone(),
            state.port,
            state.tls,
            state.tls_verify,
            state.bind_host.clone(),
            state.password.clone(),
            state.sasl.clone(),
            state.nick.clone(),
            state.username.clone(),
            state.realname.clone(),
        )
    };
    let (host, port, use_tls, tls_verify, bind_host, password, sasl, nick, username, realname) =
        params;

    info!(con_id = %handle.con_id, host = %host, port = port, tls = use_tls, "Dialing upstream");
    let stream = match dial(&host, port, &bind_host).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(con_id = %handle.con_id, error = %e, "Dial failed");
            notice_linked(shared, handle, &format!("Could not connect to {host}:{port}: {e}"))
                .await;
            return Ok(());
        }
    };

    let mut transport = if use_tls {
        let connector = match tls::connector(tls_verify) {
            Ok(c) => c,
            Err(e) => {
                warn!(con_id = %handle.con_id, error = %e, "TLS setup failed");
                return Ok(());
            }
        };
        let server_name = match ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(_) => {
                warn!(con_id = %handle.con_id, host = %host, "Invalid TLS server name");
                return Ok(());
            }
        };
        match connector.connect(server_name, stream).await {
            Ok(tls_stream) => Transport::Tls(Box::new(Framed::new(tls_stream, LineCodec::new()))),
            Err(e) => {
                warn!(con_id = %handle.con_id, error = %e, "TLS handshake failed");
                notice_linked(shared, handle, &format!("TLS handshake with {host} failed")).await;
                return Ok(());
            }
        }
    } else {
        Transport::Plain(Framed::new(stream, LineCodec::new()))
    };

    {
        let mut state = handle.state.lock().await;
        state.connected = true;
        state.net_registered = false;
        state.received_motd = false;
        state.registration_lines.clear();
        state.isupports.clear();
        if state.nick.is_empty() {
            state.nick = username.clone();
        }
        state.save(&shared.db).await?;
    }

    // Registration, in wire order: PASS, the SASL CAP window, NICK, USER.
    let mut sasl_phase = match sasl {
        Some(credentials) => SaslPhase::WantCaps(credentials),
        None => SaslPhase::Disabled,
    };
    let mut registration = Vec::new();
    if !password.is_empty() {
        registration.push(format!("PASS {password}"));
    }
    if matches!(sasl_phase, SaslPhase::WantCaps(_)) {
        registration.push("CAP LS 302".to_string());
    }
    let nick = if nick.is_empty() { username.clone() } else { nick };
    let username = if username.is_empty() { nick.clone() } else { username };
    registration.push(format!("NICK {nick}"));
    registration.push(format!("USER {username} 0 * :{realname}"));
    for line in registration {
        if transport.send_line(line).await.is_err() {
            teardown(shared, handle, "Write failed during registration").await?;
            return Ok(());
        }
    }

    let mut shutdown = shared.shutdown_signal();
    let reason = loop {
        tokio::select! {
            line = transport.next_line() => match line {
                Some(Ok(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    let replies = handle_line(shared, handle, &line, &mut sasl_phase).await?;
                    let mut failed = false;
                    for reply in replies {
                        if transport.send_line(reply).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break "Write to network failed";
                    }
                }
                Some(Err(e)) => {
                    warn!(con_id = %handle.con_id, error = %e, "Upstream read error");
                    break "Read error from network";
                }
                None => break "Disconnected from network",
            },
            Some(msg) = rx.recv() => {
                if transport.send_line(msg.to_string()).await.is_err() {
                    break "Write to network failed";
                }
            }
            _ = handle.close.notified() => {
                let _ = transport.send_line("QUIT :disconnecting".to_string()).await;
                break "Disconnected";
            }
            _ = shutdown.changed() => {
                let _ = transport.send_line("QUIT :shutting down".to_string()).await;
                return Ok(());
            }
        }
    };

    teardown(shared, handle, reason).await
}

/// Mark the record disconnected and tell the attached clients.
async fn teardown(
    shared: &Arc<Shared>,
    handle: &Arc<ConnectionHandle>,
    reason: &str,
) -> Result<(), DbError> {
    {
        let mut state = handle.state.lock().await;
        state.connected = false;
        state.net_registered = false;
        state.save(&shared.db).await?;
    }
    info!(con_id = %handle.con_id, reason = %reason, "Upstream down");
    notice_linked(shared, handle, reason).await;
    Ok(())
}

/// Process one line from the network. Returns lines to write back to the
/// network (PONG, SASL steps).
async fn handle_line(
    shared: &Arc<Shared>,
    handle: &Arc<ConnectionHandle>,
    line: &str,
    sasl: &mut SaslPhase,
) -> Result<Vec<String>, DbError> {
    let Ok(msg) = line.parse::<Message>() else {
        debug!(con_id = %handle.con_id, raw = %line, "Unparseable upstream line");
        return Ok(Vec::new());
    };
    let mut replies = Vec::new();

    // Keepalive is ours to answer, never the clients'.
    if msg.verb == "PING" {
        replies.push(Message::pong(msg.arg(0).unwrap_or("")).to_string());
        return Ok(replies);
    }

    // SASL window, before anything is captured or forwarded.
    if matches!(msg.verb.as_str(), "CAP" | "AUTHENTICATE" | "903" | "904" | "908") {
        sasl_step(handle, &msg, sasl, &mut replies).await;
        return Ok(replies);
    }

    let registered_now = {
        let mut state = handle.state.lock().await;

        if !state.received_motd {
            apply_pre_motd(&mut state, &msg, line, &mut replies);
            let done = state.received_motd;
            state.save(&shared.db).await?;
            if !done {
                return Ok(replies);
            }
            true
        } else {
            if apply_post_motd(&mut state, &msg) {
                state.save(&shared.db).await?;
            }
            false
        }
    };

    if registered_now {
        info!(con_id = %handle.con_id, "Upstream registered (end of MOTD)");
        for con in shared.registry.linked_clients(handle, None).await {
            handlers::register_client(&con, handle).await;
        }
        return Ok(replies);
    }

    // Log traffic addressed to the user.
    if matches!(msg.verb.as_str(), "PRIVMSG" | "NOTICE") {
        let (logging, user_id, network_id) = {
            let state = handle.state.lock().await;
            (state.logging, state.auth_user_id, state.auth_network_id)
        };
        if logging
            && let (Some(target), Some(text)) = (msg.arg(0), msg.arg(1))
        {
            let prefix = msg
                .prefix
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            let logged = crate::db::LoggedMessage {
                command: msg.verb.clone(),
                prefix,
                target: target.to_string(),
                text: text.to_string(),
            };
            shared
                .db
                .history()
                .store(user_id, network_id, &logged)
                .await?;
        }
    }

    // Everything post-registration fans out to every attached client.
    for con in shared.registry.linked_clients(handle, None).await {
        con.send(msg.clone()).await;
    }

    Ok(replies)
}

/// Registration-burst handling: capture numerics, collect ISUPPORT, retry
/// a taken nick, and detect the MOTD terminus.
fn apply_pre_motd(
    state: &mut ConnectionState,
    msg: &Message,
    raw: &str,
    replies: &mut Vec<String>,
) {
    let verb = msg.verb.as_str();
    let is_numeric = verb.len() == 3 && verb.bytes().all(|b| b.is_ascii_digit());
    if !is_numeric {
        return;
    }

    match verb {
        "433" => {
            // Nick in use; retry with a suffix until the network yields.
            state.nick.push('_');
            replies.push(format!("NICK {}", state.nick));
        }
        "001" => {
            // The network tells us our accepted nick.
            if let Some(nick) = msg.arg(0) {
                state.nick = nick.to_string();
            }
            state.registration_lines.push(raw.to_string());
        }
        "005" => {
            state.isupports.extend(isupport::isupport_tokens(msg));
            state.registration_lines.push(raw.to_string());
        }
        "376" | "422" => {
            state.registration_lines.push(raw.to_string());
            state.received_motd = true;
            state.net_registered = true;
        }
        _ => {
            state.registration_lines.push(raw.to_string());
        }
    }
}

/// Post-registration state tracking: own nick, channel membership, topics.
/// Returns whether anything worth persisting changed.
fn apply_post_motd(state: &mut ConnectionState, msg: &Message) -> bool {
    let own_nick = state.nick.clone();
    let from_self = msg
        .source_nick()
        .is_some_and(|nick| tether_proto::irc_eq(nick, &own_nick));

    match msg.verb.as_str() {
        "NICK" if from_self => {
            if let Some(new_nick) = msg.arg(0) {
                state.nick = new_nick.to_string();
                return true;
            }
            false
        }
        "JOIN" if from_self => {
            if let Some(channel) = msg.arg(0) {
                state.get_or_add_buffer(channel).joined = true;
                return true;
            }
            false
        }
        "PART" if from_self => {
            if let Some(channel) = msg.arg(0)
                && let Some(buffer) = state.get_buffer_mut(channel)
            {
                buffer.joined = false;
                return true;
            }
            false
        }
        "KICK" => {
            if let (Some(channel), Some(victim)) = (msg.arg(0), msg.arg(1))
                && tether_proto::irc_eq(victim, &own_nick)
                && let Some(buffer) = state.get_buffer_mut(channel)
            {
                buffer.joined = false;
                return true;
            }
            false
        }
        "TOPIC" => {
            if let Some(channel) = msg.arg(0) {
                let topic = msg.arg(1).unwrap_or("").to_string();
                state.get_or_add_buffer(channel).topic = topic;
                return true;
            }
            false
        }
        // RPL_TOPIC after a join.
        "332" => {
            if let (Some(channel), Some(topic)) = (msg.arg(1), msg.arg(2)) {
                let topic = topic.to_string();
                state.get_or_add_buffer(channel).topic = topic;
                return true;
            }
            false
        }
        "PRIVMSG" | "NOTICE" => {
            if let Some(target) = msg.arg(0) {
                // A query buffer keys on the correspondent, a channel on
                // itself.
                let buffer_name = if isupport::is_channel_name(target, state.chantypes()) {
                    Some(target.to_string())
                } else {
                    msg.source_nick().map(str::to_string)
                };
                if let Some(name) = buffer_name {
                    state.get_or_add_buffer(&name).last_seen = chrono::Utc::now();
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}

/// Drive SASL PLAIN through its CAP window.
async fn sasl_step(
    handle: &Arc<ConnectionHandle>,
    msg: &Message,
    phase: &mut SaslPhase,
    replies: &mut Vec<String>,
) {
    match std::mem::replace(phase, SaslPhase::Done) {
        SaslPhase::WantCaps(credentials) => {
            let offered = msg.verb == "CAP"
                && msg.arg(1).is_some_and(|sub| sub.eq_ignore_ascii_case("LS"))
                && msg
                    .arg(2)
                    .is_some_and(|caps| caps.split_whitespace().any(|c| c.starts_with("sasl")));
            if offered {
                replies.push("CAP REQ :sasl".to_string());
                *phase = SaslPhase::WantAck(credentials);
            } else {
                debug!(con_id = %handle.con_id, "Network does not offer sasl, skipping");
                replies.push("CAP END".to_string());
            }
        }
        SaslPhase::WantAck(credentials) => {
            if msg.verb == "CAP" && msg.arg(1).is_some_and(|sub| sub.eq_ignore_ascii_case("ACK")) {
                replies.push("AUTHENTICATE PLAIN".to_string());
                *phase = SaslPhase::WantChallenge(credentials);
            } else {
                replies.push("CAP END".to_string());
            }
        }
        SaslPhase::WantChallenge(credentials) => {
            if msg.verb == "AUTHENTICATE" && msg.arg(0) == Some("+") {
                let payload = format!(
                    "{}\0{}\0{}",
                    credentials.account, credentials.account, credentials.password
                );
                replies.push(format!("AUTHENTICATE {}", BASE64.encode(payload)));
                *phase = SaslPhase::WantResult;
            } else {
                replies.push("CAP END".to_string());
            }
        }
        SaslPhase::WantResult => {
            match msg.verb.as_str() {
                "903" => info!(con_id = %handle.con_id, "SASL authentication successful"),
                _ => warn!(con_id = %handle.con_id, verb = %msg.verb, "SASL authentication failed"),
            }
            replies.push("CAP END".to_string());
        }
        SaslPhase::Disabled => {
            *phase = SaslPhase::Disabled;
        }
        SaslPhase::Done => {}
    }
}

/// TCP dial, optionally from a configured local address.
async fn dial(host: &str, port: u16, bind_host: &str) -> std::io::Result<TcpStream> {
    if bind_host.is_empty() {
        return TcpStream::connect((host, port)).await;
    }

    let bind_ip: IpAddr = bind_host.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid bind host: {bind_host}"),
        )
    })?;

    let mut last_err = None;
    for addr in lookup_host((host, port)).await? {
        if addr.is_ipv4() != bind_ip.is_ipv4() {
            continue;
        }
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Err(e) = socket.bind(SocketAddr::new(bind_ip, 0)) {
            last_err = Some(e);
            continue;
        }
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no usable address")
    }))
}

/// Status NOTICE to every attached client.
async fn notice_linked(shared: &Arc<Shared>, handle: &Arc<ConnectionHandle>, text: &str) {
    for con in shared.registry.linked_clients(handle, None).await {
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
        con.send(Message::notice(&nick, text).with_prefix(Prefix::ServerName(prefix)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> ConnectionState {
        let mut state = ConnectionState::new("out-1-1", ConnectionKind::Outgoing);
        state.nick = "alice".to_string();
        state
    }

    fn msg(raw: &str) -> Message {
        raw.parse().expect("valid test line")
    }

    #[test]
    fn captures_burst_until_motd_end() {
        let mut state = outgoing();
        let mut replies = Vec::new();

        let welcome = ":irc.net 001 alice :Welcome";
        apply_pre_motd(&mut state, &msg(welcome), welcome, &mut replies);
        let isupport = ":irc.net 005 alice CHANTYPES=# :are supported by this server";
        apply_pre_motd(&mut state, &msg(isupport), isupport, &mut replies);
        assert!(!state.received_motd);

        let end = ":irc.net 376 alice :End of /MOTD command.";
        apply_pre_motd(&mut state, &msg(end), end, &mut replies);

        assert!(state.received_motd);
        assert!(state.net_registered);
        assert_eq!(state.registration_lines.len(), 3);
        assert_eq!(state.isupports, vec!["CHANTYPES=#"]);
        assert!(replies.is_empty());
    }

    #[test]
    fn motd_missing_numeric_also_terminates() {
        let mut state = outgoing();
        let mut replies = Vec::new();
        let line = ":irc.net 422 alice :MOTD File is missing";
        apply_pre_motd(&mut state, &msg(line), line, &mut replies);
        assert!(state.received_motd);
    }

    #[test]
    fn taken_nick_retries_with_suffix() {
        let mut state = outgoing();
        let mut replies = Vec::new();
        let line = ":irc.net 433 * alice :Nickname is already in use";
        apply_pre_motd(&mut state, &msg(line), line, &mut replies);
        assert_eq!(state.nick, "alice_");
        assert_eq!(replies, vec!["NICK alice_".to_string()]);
        // Collision lines are not part of the replayable burst.
        assert!(state.registration_lines.is_empty());
    }

    #[test]
    fn non_numeric_noise_is_not_captured() {
        let mut state = outgoing();
        let mut replies = Vec::new();
        let line = "NOTICE * :*** Looking up your hostname";
        apply_pre_motd(&mut state, &msg(line), line, &mut replies);
        assert!(state.registration_lines.is_empty());
    }

    #[test]
    fn tracks_own_membership_and_topics() {
        let mut state = outgoing();

        apply_post_motd(&mut state, &msg(":alice!a@h JOIN #rust"));
        assert!(state.get_buffer("#rust").unwrap().joined);

        apply_post_motd(&mut state, &msg(":irc.net 332 alice #rust :the topic"));
        assert_eq!(state.get_buffer("#rust").unwrap().topic, "the topic");

        apply_post_motd(&mut state, &msg(":alice!a@h PART #rust"));
        assert!(!state.get_buffer("#rust").unwrap().joined);

        // Someone else's join doesn't touch our buffers.
        apply_post_motd(&mut state, &msg(":bob!b@h JOIN #other"));
        assert!(state.get_buffer("#other").is_none());
    }

    #[test]
    fn kick_clears_joined() {
        let mut state = outgoing();
        apply_post_motd(&mut state, &msg(":alice!a@h JOIN #rust"));
        apply_post_motd(&mut state, &msg(":op!o@h KICK #rust alice :bye"));
        assert!(!state.get_buffer("#rust").unwrap().joined);
    }

    #[test]
    fn own_nick_change_is_tracked() {
        let mut state = outgoing();
        apply_post_motd(&mut state, &msg(":alice!a@h NICK alice2"));
        assert_eq!(state.nick, "alice2");

        apply_post_motd(&mut state, &msg(":stranger!s@h NICK other"));
        assert_eq!(state.nick, "alice2");
    }

    #[test]
    fn query_buffer_keys_on_correspondent() {
        let mut state = outgoing();
        apply_post_motd(&mut state, &msg(":bob!b@h PRIVMSG alice :hey"));
        let buffer = state.get_buffer("bob").expect("query buffer");
        assert!(!buffer.is_channel);
    }
}
