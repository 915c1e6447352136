use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use relay_types::{RelayError, Result};

/// Async SQLite database connection manager.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection from file path.
    pub async fn new(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_millis(5000))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| RelayError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a new in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| RelayError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Initialize all database tables and indexes.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS groups (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                folder TEXT NOT NULL UNIQUE,
                trigger_pattern TEXT NOT NULL,
                allowed_senders TEXT,
                container_config TEXT,
                requires_trigger INTEGER NOT NULL DEFAULT 1,
                is_main INTEGER NOT NULL DEFAULT 0,
                added_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create groups table: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode TEXT NOT NULL DEFAULT 'group',
                status TEXT NOT NULL DEFAULT 'active',
                next_run TEXT,
                last_run TEXT,
                last_result TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create tasks table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_due
             ON tasks(status, next_run)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create tasks due index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_folder
             ON tasks(group_folder)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create tasks folder index: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_run_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                run_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create task_run_logs table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_run_logs_task
             ON task_run_logs(task_id, run_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create task_run_logs index: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                group_folder TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Database(format!("Create sessions table: {e}")))?;

        info!("Database schema initialized (4 tables, 3 indexes)");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}

/// Fixed-width UTC encoding so that text comparison in SQL orders chronologically.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelayError::Database(format!("Invalid timestamp '{value}': {e}")))
}

pub(crate) fn decode_opt_ts(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(decode_ts).transpose()
}
