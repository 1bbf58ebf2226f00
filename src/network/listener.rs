//! The client listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::network::downstream;
use crate::shared::Shared;

/// Accept loop for downstream clients.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind the configured listen address.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Listening for clients");
        Ok(Self { listener })
    }

    /// Local address actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown is requested.
    pub async fn run(self, shared: Arc<Shared>) {
        let mut shutdown = shared.shutdown_signal();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(downstream::run_downstream(
                            Arc::clone(&shared),
                            stream,
                            addr,
                        ));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.changed() => {
                    info!("Shutdown requested, no longer accepting");
                    break;
                }
            }
        }
    }
}
