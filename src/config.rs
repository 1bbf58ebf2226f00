//! Configuration loading.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub listen: ListenConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Identity the bouncer presents on synthesized lines.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `:prefix` on lines the bouncer originates.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

/// Client listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub address: SocketAddr,
}

/// Database location.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_prefix() -> String {
    "bnc".to_string()
}

fn default_db_path() -> String {
    "tetherd.db".to_string()
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// In-memory defaults, used by tests.
    pub fn for_tests() -> Self {
        Config {
            server: ServerConfig::default(),
            listen: ListenConfig {
                address: "127.0.0.1:0".parse().expect("valid loopback address"),
            },
            database: DatabaseConfig {
                path: ":memory:".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: Config = toml::from_str(
            r#"
            [listen]
            address = "127.0.0.1:6667"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.prefix, "bnc");
        assert_eq!(config.database.path, "tetherd.db");
        assert_eq!(config.listen.address.port(), 6667);
    }

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            prefix = "mybnc"

            [listen]
            address = "0.0.0.0:1025"

            [database]
            path = "/var/lib/tetherd/state.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.prefix, "mybnc");
        assert_eq!(config.database.path, "/var/lib/tetherd/state.db");
    }
}
