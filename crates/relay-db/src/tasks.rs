use chrono::{DateTime, Utc};

use relay_types::{RelayError, Result, ScheduledTask, TaskStatus};

use crate::connection::{decode_opt_ts, decode_ts, encode_ts, Database};

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
     context_mode, status, next_run, last_run, last_result, created_at";

/// Repository for scheduled task storage and retrieval.
pub struct TaskRepository<'a> {
    db: &'a Database,
}

impl<'a> TaskRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new task.
    pub async fn insert(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks
             (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
              context_mode, status, next_run, last_run, last_result, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_type.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.status.as_str())
        .bind(task.next_run.map(encode_ts))
        .bind(task.last_run.map(encode_ts))
        .bind(&task.last_result)
        .bind(encode_ts(task.created_at))
        .execute(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Insert task: {e}")))?;

        Ok(())
    }

    /// Get a task by ID.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
                .bind(task_id)
                .fetch_optional(self.db.pool())
                .await
                .map_err(|e| RelayError::Database(format!("Get task: {e}")))?;

        row.map(row_to_task).transpose()
    }

    /// Get all tasks.
    pub async fn get_all(&self) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC"
        ))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Get all tasks: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Get tasks owned by a working folder.
    pub async fn get_by_folder(&self, group_folder: &str) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE group_folder = ?
             ORDER BY created_at ASC"
        ))
        .bind(group_folder)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Get tasks by folder: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Get tasks that are due to run (active + next_run <= now).
    pub async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY next_run ASC"
        ))
        .bind(encode_ts(now))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Get due tasks: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Update task status.
    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(task_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| RelayError::Database(format!("Update task status: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Set status and next run together (used when resuming).
    pub async fn update_schedule(
        &self,
        task_id: &str,
        status: TaskStatus,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE tasks SET status = ?, next_run = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(next_run.map(encode_ts))
            .bind(task_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| RelayError::Database(format!("Update task schedule: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist the outcome of a run.
    ///
    /// `status` of `None` keeps the current status. A cancelled task stays
    /// cancelled even if it was cancelled while the run was in flight.
    pub async fn update_after_run(
        &self,
        task_id: &str,
        next_run: Option<DateTime<Utc>>,
        last_run: DateTime<Utc>,
        last_result: &str,
        status: Option<TaskStatus>,
    ) -> Result<bool> {
        let status = status.map(|s| s.as_str());
        let result = sqlx::query(
            "UPDATE tasks
             SET next_run = ?, last_run = ?, last_result = ?,
                 status = CASE WHEN ? IS NULL OR status = 'cancelled' THEN status ELSE ? END
             WHERE id = ?",
        )
        .bind(next_run.map(encode_ts))
        .bind(encode_ts(last_run))
        .bind(last_result)
        .bind(status)
        .bind(status)
        .bind(task_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Update task after run: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    group_folder: String,
    chat_jid: String,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
    context_mode: String,
    status: String,
    next_run: Option<String>,
    last_run: Option<String>,
    last_result: Option<String>,
    created_at: String,
}

fn row_to_task(row: TaskRow) -> Result<ScheduledTask> {
    Ok(ScheduledTask {
        schedule_type: row.schedule_type.parse()?,
        context_mode: row.context_mode.parse()?,
        status: row.status.parse()?,
        next_run: decode_opt_ts(row.next_run.as_deref())?,
        last_run: decode_opt_ts(row.last_run.as_deref())?,
        created_at: decode_ts(&row.created_at)?,
        id: row.id,
        group_folder: row.group_folder,
        chat_jid: row.chat_jid,
        prompt: row.prompt,
        schedule_value: row.schedule_value,
        last_result: row.last_result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relay_types::{ContextMode, ScheduleType};

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn make_task(id: &str, folder: &str, prompt: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_jid: format!("tg:{folder}"),
            prompt: prompt.to_string(),
            schedule_type: ScheduleType::Cron,
            schedule_value: "0 9 * * *".to_string(),
            context_mode: ContextMode::Group,
            status: TaskStatus::Active,
            next_run: Some(Utc::now()),
            last_run: None,
            last_result: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_task() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);

        let mut task = make_task("t1", "acme", "Run report");
        task.context_mode = ContextMode::Isolated;
        repo.insert(&task).await.unwrap();

        let found = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(found.prompt, "Run report");
        assert_eq!(found.chat_jid, "tg:acme");
        assert_eq!(found.schedule_type, ScheduleType::Cron);
        assert_eq!(found.context_mode, ContextMode::Isolated);
        assert_eq!(found.status, TaskStatus::Active);
        assert!(found.last_run.is_none());

        assert!(repo.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);

        repo.insert(&make_task("t1", "acme", "A")).await.unwrap();
        assert!(repo.insert(&make_task("t1", "acme", "B")).await.is_err());
    }

    #[tokio::test]
    async fn update_status() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);

        repo.insert(&make_task("t1", "g1", "T1")).await.unwrap();
        assert!(repo.update_status("t1", TaskStatus::Paused).await.unwrap());
        assert!(!repo.update_status("nope", TaskStatus::Paused).await.unwrap());

        let found = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn get_by_folder() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);

        repo.insert(&make_task("t1", "g1", "T1")).await.unwrap();
        repo.insert(&make_task("t2", "g1", "T2")).await.unwrap();
        repo.insert(&make_task("t3", "g2", "T3")).await.unwrap();

        assert_eq!(repo.get_by_folder("g1").await.unwrap().len(), 2);
        assert_eq!(repo.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_due_tasks() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);
        let now = Utc::now();

        let mut due = make_task("due", "g1", "Due");
        due.next_run = Some(now - Duration::hours(1));
        repo.insert(&due).await.unwrap();

        let mut future = make_task("future", "g1", "Future");
        future.next_run = Some(now + Duration::hours(1));
        repo.insert(&future).await.unwrap();

        let mut paused = make_task("paused", "g1", "Paused");
        paused.next_run = Some(now - Duration::hours(1));
        paused.status = TaskStatus::Paused;
        repo.insert(&paused).await.unwrap();

        let mut unscheduled = make_task("done", "g1", "Done");
        unscheduled.next_run = None;
        repo.insert(&unscheduled).await.unwrap();

        let due_tasks = repo.get_due(now).await.unwrap();
        assert_eq!(due_tasks.len(), 1);
        assert_eq!(due_tasks[0].id, "due");
    }

    #[tokio::test]
    async fn update_after_run_keeps_cancellation() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);
        let now = Utc::now();

        repo.insert(&make_task("t1", "g1", "T1")).await.unwrap();
        repo.update_status("t1", TaskStatus::Cancelled).await.unwrap();
        repo.update_after_run("t1", None, now, "Completed", Some(TaskStatus::Completed))
            .await
            .unwrap();

        let found = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Cancelled);
        assert_eq!(found.last_result.as_deref(), Some("Completed"));
        assert!(found.next_run.is_none());
    }

    #[tokio::test]
    async fn update_after_run_without_status_change() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);
        let now = Utc::now();
        let next = now + Duration::minutes(5);

        repo.insert(&make_task("t1", "g1", "T1")).await.unwrap();
        repo.update_after_run("t1", Some(next), now, "ok", None)
            .await
            .unwrap();

        let found = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Active);
        assert_eq!(
            found.next_run.map(|t| t.timestamp_millis()),
            Some(next.timestamp_millis())
        );
        assert!(found.last_run.is_some());
    }

    #[tokio::test]
    async fn update_schedule_sets_status_and_next_run() {
        let db = setup().await;
        let repo = TaskRepository::new(&db);
        let next = Utc::now() + Duration::hours(2);

        let mut task = make_task("t1", "g1", "T1");
        task.status = TaskStatus::Paused;
        repo.insert(&task).await.unwrap();

        repo.update_schedule("t1", TaskStatus::Active, Some(next))
            .await
            .unwrap();
        let found = repo.get_task("t1").await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Active);
        assert!(found.next_run.is_some());
    }
}
