//! tetherd - a persistent IRC bouncer.

use tetherd::config::Config;
use tetherd::db::Database;
use tetherd::network::{Listener, upstream};
use tetherd::shared::Shared;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tetherd.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        listen = %config.listen.address,
        prefix = %config.server.prefix,
        "Starting tetherd"
    );

    let db = Database::new(&config.database.path).await?;
    let listen_addr = config.listen.address;
    let shared = Shared::new(config, db);

    // Bring back every upstream session the previous run had.
    upstream::resume_upstreams(&shared).await?;

    let listener = Listener::bind(listen_addr).await?;
    listener.run(shared).await;

    info!("Shutdown complete");
    Ok(())
}
