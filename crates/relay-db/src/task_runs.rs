use relay_types::{RelayError, Result, TaskRun};

use crate::connection::{decode_ts, encode_ts, Database};

/// Append-only run history for scheduled tasks.
pub struct TaskRunRepository<'a> {
    db: &'a Database,
}

impl<'a> TaskRunRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append a run record. Returns the new row id.
    pub async fn append(&self, run: &TaskRun) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.task_id)
        .bind(encode_ts(run.run_at))
        .bind(run.duration_ms)
        .bind(run.status.as_str())
        .bind(&run.result)
        .bind(&run.error)
        .execute(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Append task run: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    /// Run history of one task, oldest first.
    pub async fn list_for_task(&self, task_id: &str) -> Result<Vec<TaskRun>> {
        let rows: Vec<TaskRunRow> = sqlx::query_as(
            "SELECT id, task_id, run_at, duration_ms, status, result, error
             FROM task_run_logs WHERE task_id = ?
             ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("List task runs: {e}")))?;

        rows.into_iter().map(row_to_run).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRunRow {
    id: i64,
    task_id: String,
    run_at: String,
    duration_ms: i64,
    status: String,
    result: Option<String>,
    error: Option<String>,
}

fn row_to_run(row: TaskRunRow) -> Result<TaskRun> {
    Ok(TaskRun {
        id: Some(row.id),
        run_at: decode_ts(&row.run_at)?,
        status: row.status.parse()?,
        task_id: row.task_id,
        duration_ms: row.duration_ms,
        result: row.result,
        error: row.error,
    })
}
