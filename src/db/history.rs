//! Logged message traffic.
//!
//! Messages the user sends (and later, receives) are appended here keyed by
//! `(user_id, network_id)` so a detached session can be reviewed later. The
//! envelope is a JSON blob, which lets fields grow without schema
//! migrations.

use super::DbError;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tether_proto::irc_to_lower;

/// Stored form of one logged line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedMessage {
    /// "PRIVMSG" or "NOTICE".
    pub command: String,
    /// Sender prefix as it appeared (or was synthesized) on the wire.
    pub prefix: String,
    /// Target buffer (channel or nick), display form.
    pub target: String,
    /// Message body.
    pub text: String,
}

/// Repository for the message log.
pub struct HistoryRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> HistoryRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one message for a user's network.
    pub async fn store(
        &self,
        user_id: i64,
        network_id: i64,
        message: &LoggedMessage,
    ) -> Result<(), DbError> {
        let envelope = serde_json::to_string(message)?;
        let sent_at = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO messages (user_id, network_id, buffer, envelope, sent_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(network_id)
        .bind(irc_to_lower(&message.target))
        .bind(&envelope)
        .bind(sent_at)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Most recent messages for one buffer, oldest first.
    pub async fn recent(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
        limit: i64,
    ) -> Result<Vec<LoggedMessage>, DbError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT envelope FROM messages \
             WHERE user_id = ? AND network_id = ? AND buffer = ? \
             ORDER BY sent_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(network_id)
        .bind(irc_to_lower(buffer))
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(|(envelope,)| serde_json::from_str(&envelope).map_err(DbError::from))
            .collect::<Result<Vec<LoggedMessage>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Drop all logged messages for one buffer.
    pub async fn delete_buffer(
        &self,
        user_id: i64,
        network_id: i64,
        buffer: &str,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE user_id = ? AND network_id = ? AND buffer = ?",
        )
        .bind(user_id)
        .bind(network_id)
        .bind(irc_to_lower(buffer))
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn store_and_read_back() {
        let db = Database::new(":memory:").await.unwrap();
        let history = db.history();

        let msg = LoggedMessage {
            command: "PRIVMSG".into(),
            prefix: "alice".into(),
            target: "#Rust".into(),
            text: "hi".into(),
        };
        history.store(4, 9, &msg).await.unwrap();

        let back = history.recent(4, 9, "#rust", 10).await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].text, "hi");

        // scoped to (user, network)
        assert!(history.recent(4, 8, "#rust", 10).await.unwrap().is_empty());

        assert_eq!(history.delete_buffer(4, 9, "#RUST").await.unwrap(), 1);
        assert!(history.recent(4, 9, "#rust", 10).await.unwrap().is_empty());
    }
}
