//! Downstream client connections.
//!
//! One task per accepted socket. Lines are read and dispatched strictly in
//! arrival order; a line's handling (including any persistence it does)
//! completes before the next line is read. Outbound traffic queues on the
//! handle's channel and is written between reads.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use tether_proto::{LineCodec, Message};

use crate::handlers::{self, HandlerError, MsgSource};
use crate::shared::Shared;
use crate::state::{ConnectionHandle, ConnectionKind};

/// Run one downstream connection to completion.
pub async fn run_downstream(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let con_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let handle = ConnectionHandle::new(&con_id, ConnectionKind::Incoming, tx);
    {
        let mut state = handle.state.lock().await;
        state.server_prefix = shared.config.server.prefix.clone();
        state.connected = true;
    }
    shared.registry.insert(Arc::clone(&handle));
    info!(con_id = %con_id, addr = %addr, "Client connected");

    let mut framed = Framed::new(stream, LineCodec::new());
    let mut shutdown = shared.shutdown_signal();

    loop {
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match handlers::process_line(&shared, &handle, &line, MsgSource::Socket).await {
                        Ok(()) => {}
                        Err(HandlerError::InvalidPassword) => {
                            let _ = framed
                                .send(Message::error("Invalid password").to_string())
                                .await;
                            break;
                        }
                        Err(HandlerError::Close) => break,
                        Err(e @ HandlerError::Db(_)) => {
                            // State may be ahead of the store; drop the
                            // client rather than acknowledge a write that
                            // did not land.
                            warn!(con_id = %con_id, code = e.error_code(), error = %e, "Persistence failure, closing client");
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!(con_id = %con_id, error = %e, "Client read error");
                    break;
                }
                None => break,
            },
            Some(msg) = rx.recv() => {
                if framed.send(msg.to_string()).await.is_err() {
                    break;
                }
            }
            _ = handle.close.notified() => break,
            _ = shutdown.changed() => break,
        }
    }

    // Flush whatever the last handler queued before tearing down.
    while let Ok(msg) = rx.try_recv() {
        if framed.send(msg.to_string()).await.is_err() {
            break;
        }
    }

    teardown(&shared, &handle).await;
    info!(con_id = %con_id, addr = %addr, "Client disconnected");
}

/// Unlink from the upstream, drop the persisted row, leave the registry.
async fn teardown(shared: &Arc<Shared>, handle: &Arc<ConnectionHandle>) {
    let upstream_id = { handle.state.lock().await.upstream_con_id.clone() };
    if let Some(upstream_id) = upstream_id
        && let Some(upstream) = shared.registry.get(&upstream_id)
        && let Err(e) = upstream
            .state
            .lock()
            .await
            .unlink_incoming_connection(&shared.db, &handle.con_id)
            .await
    {
        warn!(con_id = %handle.con_id, error = %e, "Failed to unlink from upstream");
    }

    if let Err(e) = handle.state.lock().await.destroy(&shared.db).await {
        warn!(con_id = %handle.con_id, error = %e, "Failed to destroy connection record");
    }
    shared.registry.remove(&handle.con_id);
}
