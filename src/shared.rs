//! Shared process state.
//!
//! One `Shared` exists per process, holding the registry of live
//! connections, the database pool, the verb handler table, and the
//! shutdown signal. Everything that runs a connection task gets an
//! `Arc<Shared>`.

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::config::Config;
use crate::db::Database;
use crate::handlers::HandlerTable;
use crate::state::Registry;

/// Shared state container.
pub struct Shared {
    pub config: Config,
    pub db: Database,
    pub registry: Registry,
    /// Verb dispatch table; RELOAD swaps in a fresh one. Readers clone the
    /// Arc and release the lock before any handler runs.
    pub handlers: RwLock<Arc<HandlerTable>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Shared {
            config,
            db,
            registry: Registry::new(),
            handlers: RwLock::new(Arc::new(HandlerTable::new())),
            shutdown,
        })
    }

    /// Ask the process to stop accepting and exit.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Receiver that resolves when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
