//! Durable connection rows.
//!
//! One row per connection record, keyed by `conid`. Complex fields arrive
//! here already serialized as JSON strings; the state layer owns the
//! conversion in both directions. Every save is a whole-row
//! `INSERT OR REPLACE`, so a record can be written regardless of whether it
//! existed before.

use super::DbError;
use sqlx::SqlitePool;

/// Raw persisted form of a connection record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConnectionRow {
    pub conid: String,
    pub kind: String,
    pub net_registered: bool,
    pub connected: bool,
    pub server_prefix: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub account: String,
    pub password: String,
    pub host: String,
    pub port: i64,
    pub tls: bool,
    pub tls_verify: bool,
    pub bind_host: String,
    /// JSON: `{"account","password"}` or `null`.
    pub sasl: String,
    /// JSON array of raw IRC lines.
    pub registration_lines: String,
    /// JSON array of ISUPPORT tokens.
    pub isupports: String,
    /// JSON array of capability names.
    pub caps: String,
    /// JSON array of buffer objects.
    pub buffers: String,
    pub received_motd: bool,
    pub auth_user_id: i64,
    pub auth_network_id: i64,
    pub auth_network_name: String,
    pub auth_admin: bool,
    pub upstream_conid: Option<String>,
    /// JSON array of incoming connection ids.
    pub linked_incoming: String,
    pub logging: bool,
    /// JSON registration scratch.
    pub scratch: String,
}

/// Repository for connection rows.
pub struct ConnectionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConnectionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the whole row.
    pub async fn save(&self, row: &ConnectionRow) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO connections
            (conid, kind, net_registered, connected, server_prefix, nick, username,
             realname, account, password, host, port, tls, tls_verify, bind_host,
             sasl, registration_lines, isupports, caps, buffers, received_motd,
             auth_user_id, auth_network_id, auth_network_name, auth_admin,
             upstream_conid, linked_incoming, logging, scratch)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.conid)
        .bind(&row.kind)
        .bind(row.net_registered)
        .bind(row.connected)
        .bind(&row.server_prefix)
        .bind(&row.nick)
        .bind(&row.username)
        .bind(&row.realname)
        .bind(&row.account)
        .bind(&row.password)
        .bind(&row.host)
        .bind(row.port)
        .bind(row.tls)
        .bind(row.tls_verify)
        .bind(&row.bind_host)
        .bind(&row.sasl)
        .bind(&row.registration_lines)
        .bind(&row.isupports)
        .bind(&row.caps)
        .bind(&row.buffers)
        .bind(row.received_motd)
        .bind(row.auth_user_id)
        .bind(row.auth_network_id)
        .bind(&row.auth_network_name)
        .bind(row.auth_admin)
        .bind(&row.upstream_conid)
        .bind(&row.linked_incoming)
        .bind(row.logging)
        .bind(&row.scratch)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a row by connection id.
    pub async fn fetch(&self, conid: &str) -> Result<Option<ConnectionRow>, DbError> {
        let row = sqlx::query_as::<_, ConnectionRow>("SELECT * FROM connections WHERE conid = ?")
            .bind(conid)
            .fetch_optional(self.pool)
            .await?;
        Ok(row)
    }

    /// Delete a row. Returns whether anything was removed.
    pub async fn delete(&self, conid: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM connections WHERE conid = ?")
            .bind(conid)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All persisted outgoing records, for boot-time resume.
    pub async fn all_outgoing(&self) -> Result<Vec<ConnectionRow>, DbError> {
        let rows =
            sqlx::query_as::<_, ConnectionRow>("SELECT * FROM connections WHERE kind = 'outgoing'")
                .fetch_all(self.pool)
                .await?;
        Ok(rows)
    }
}
