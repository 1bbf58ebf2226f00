//! User and network store.
//!
//! The credential side of the bouncer: who may log in, and which IRC
//! networks each user has configured. Password verification is Argon2 with
//! a constant-time dummy verify when the user does not exist.

use super::DbError;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sqlx::SqlitePool;

/// A bouncer user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub admin: bool,
    pub bind_host: String,
}

/// SASL credentials for an upstream network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub account: String,
    pub password: String,
}

/// A configured upstream network.
#[derive(Debug, Clone)]
pub struct Network {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_verify: bool,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub account: String,
    pub server_password: String,
    pub bind_host: String,
    pub sasl: Option<SaslCredentials>,
}

type NetworkRow = (
    i64,
    i64,
    String,
    String,
    i64,
    bool,
    bool,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

fn network_from_row(row: NetworkRow) -> Network {
    let (
        id,
        user_id,
        name,
        host,
        port,
        tls,
        tls_verify,
        nick,
        username,
        realname,
        account,
        server_password,
        bind_host,
        sasl_account,
        sasl_password,
    ) = row;
    let sasl = if sasl_account.is_empty() {
        None
    } else {
        Some(SaslCredentials {
            account: sasl_account,
            password: sasl_password,
        })
    };
    Network {
        id,
        user_id,
        name,
        host,
        port: port as u16,
        tls,
        tls_verify,
        nick,
        username,
        realname,
        account,
        server_password,
        bind_host,
        sasl,
    }
}

const NETWORK_COLUMNS: &str = "id, user_id, name, host, port, tls, tls_verify, nick, username, \
     realname, account, server_password, bind_host, sasl_account, sasl_password";

/// Repository for user and network operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a user with a hashed password. Returns the new user.
    pub async fn create_user(&self, username: &str, password: &str) -> Result<User, DbError> {
        let hash = hash_password(password)?;
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO users (username, password_hash, admin, bind_host, created_at) \
             VALUES (?, ?, 0, '', ?)",
        )
        .bind(username)
        .bind(&hash)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(User {
            id: result.last_insert_rowid(),
            username: username.to_string(),
            admin: false,
            bind_host: String::new(),
        })
    }

    /// Add a network for a user. Returns the new network's id.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_network(
        &self,
        user_id: i64,
        name: &str,
        host: &str,
        port: u16,
        tls: bool,
        nick: &str,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            "INSERT INTO networks (user_id, name, host, port, tls, nick) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(host)
        .bind(port as i64)
        .bind(tls)
        .bind(nick)
        .execute(self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Verify a username/password pair.
    ///
    /// Returns `None` on unknown user or wrong password. An unknown user
    /// still costs one Argon2 verification, so response timing does not
    /// reveal which usernames exist.
    pub async fn auth_user(&self, username: &str, password: &str) -> Result<Option<User>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, String, bool, String)>(
            "SELECT id, username, password_hash, admin, bind_host FROM users \
             WHERE username = ? COLLATE NOCASE",
        )
        .bind(username)
        .fetch_optional(self.pool)
        .await?;

        let Some((id, username, password_hash, admin, bind_host)) = row else {
            dummy_password_verify(password);
            return Ok(None);
        };

        if !verify_password(password, &password_hash) {
            return Ok(None);
        }

        Ok(Some(User {
            id,
            username,
            admin,
            bind_host,
        }))
    }

    /// Verify credentials and resolve the named network in one step.
    ///
    /// Returns `None` when the credentials are bad or the user has no
    /// network by that name.
    pub async fn auth_user_network(
        &self,
        username: &str,
        password: &str,
        network_name: &str,
    ) -> Result<Option<Network>, DbError> {
        let Some(user) = self.auth_user(username, password).await? else {
            return Ok(None);
        };
        self.get_network_by_name(user.id, network_name).await
    }

    /// Fetch a user by id.
    pub async fn get_user(&self, id: i64) -> Result<Option<User>, DbError> {
        let row = sqlx::query_as::<_, (i64, String, bool, String)>(
            "SELECT id, username, admin, bind_host FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;
        Ok(row.map(|(id, username, admin, bind_host)| User {
            id,
            username,
            admin,
            bind_host,
        }))
    }

    /// Fetch a network by id.
    pub async fn get_network(&self, id: i64) -> Result<Option<Network>, DbError> {
        let sql = format!("SELECT {NETWORK_COLUMNS} FROM networks WHERE id = ?");
        let row = sqlx::query_as::<_, NetworkRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(network_from_row))
    }

    /// Fetch a user's network by name (case-insensitive).
    pub async fn get_network_by_name(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Option<Network>, DbError> {
        let sql = format!(
            "SELECT {NETWORK_COLUMNS} FROM networks \
             WHERE user_id = ? AND name = ? COLLATE NOCASE"
        );
        let row = sqlx::query_as::<_, NetworkRow>(&sql)
            .bind(user_id)
            .bind(name)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.map(network_from_row))
    }

    /// All networks owned by a user, ordered by name.
    pub async fn get_user_networks(&self, user_id: i64) -> Result<Vec<Network>, DbError> {
        let sql = format!("SELECT {NETWORK_COLUMNS} FROM networks WHERE user_id = ? ORDER BY name");
        let rows = sqlx::query_as::<_, NetworkRow>(&sql)
            .bind(user_id)
            .fetch_all(self.pool)
            .await?;
        Ok(rows.into_iter().map(network_from_row).collect())
    }
}

/// Hash a password with Argon2id.
fn hash_password(password: &str) -> Result<String, DbError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| DbError::Serialization(e.to_string()))
}

/// Verify a password against a stored hash.
fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Burn the same CPU as a real verification when the user is unknown.
///
/// The hash below was produced once with `hash_password` on a throwaway
/// input and matches no account; verifying against it keeps the unknown-
/// user path as slow as the wrong-password path.
fn dummy_password_verify(password: &str) {
    const UNKNOWN_USER_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$Xgve/xqCSsDUScXwL/NTFA$FVhX9AbyDjwRlZIHRU0kkMLlVEjrGUndOAKV/gRM8Mc";
    if let Ok(parsed) = PasswordHash::new(UNKNOWN_USER_HASH) {
        let _ = Argon2::default().verify_password(password.as_bytes(), &parsed);
    }
}
