use chrono::Utc;

use relay_types::{RelayError, Result};

use crate::connection::{encode_ts, Database};

/// Repository for per-folder agent session id persistence.
pub struct SessionRepository<'a> {
    db: &'a Database,
}

impl<'a> SessionRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Get the session ID for a folder, if one exists.
    pub async fn get_session(&self, group_folder: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_id FROM sessions WHERE group_folder = ?")
                .bind(group_folder)
                .fetch_optional(self.db.pool())
                .await
                .map_err(|e| RelayError::Database(format!("Get session: {e}")))?;

        Ok(row.map(|r| r.0))
    }

    /// Set (insert or update) the session ID for a folder.
    pub async fn set_session(&self, group_folder: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (group_folder, session_id, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(group_folder) DO UPDATE SET
                session_id = excluded.session_id,
                updated_at = excluded.updated_at",
        )
        .bind(group_folder)
        .bind(session_id)
        .bind(encode_ts(Utc::now()))
        .execute(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Set session: {e}")))?;

        Ok(())
    }
}
