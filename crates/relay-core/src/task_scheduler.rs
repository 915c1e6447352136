use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use relay_db::{SessionRepository, TaskRepository, TaskRunRepository};
use relay_types::{
    ContextMode, InvocationRequest, InvocationResult, NewTask, RelayError, Result, RunStatus,
    ScheduleType, ScheduledTask, TaskRun, TaskStatus,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::container_prep::prepare_container_launch;
use crate::context::RunContext;
use crate::security::validate_folder_name;

/// Longest `last_result` summary kept on a task.
const SUMMARY_MAX_CHARS: usize = 200;

/// Cron/interval/once task scheduler.
///
/// Every tick selects the due tasks and runs each in its own spawned task,
/// holding the folder lock around the invocation.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerInner {
    ctx: Arc<RunContext>,
    in_flight: Mutex<HashSet<String>>,
}

impl TaskScheduler {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        let poll_interval = Duration::from_millis(ctx.config.scheduler_poll_interval_ms);
        Self {
            inner: Arc::new(SchedulerInner {
                ctx,
                in_flight: Mutex::new(HashSet::new()),
            }),
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    /// Start the background tick loop.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler is already running");
            return;
        }

        let running = self.running.clone();
        let inner = self.inner.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Task scheduler started");
            while running.load(Ordering::SeqCst) {
                // A failing or panicking tick must not end the loop.
                match tokio::spawn(inner.clone().tick()).await {
                    Ok(Ok(started)) if !started.is_empty() => {
                        debug!(count = started.len(), "Due tasks started");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "Scheduler tick failed"),
                    Err(e) => error!(error = %e, "Scheduler tick panicked"),
                }
                tokio::time::sleep(interval).await;
            }
            info!("Task scheduler stopped");
        });

        let mut slot = self.task_handle.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut slot = self.task_handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        info!("Task scheduler stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one selection pass now. Returns the handles of the started runs.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        self.inner.clone().tick().await
    }

    /// Validate and persist a new active task with its first `next_run`.
    pub async fn create_task(&self, new: NewTask) -> Result<ScheduledTask> {
        validate_folder_name(&new.group_folder)?;
        if new.prompt.trim().is_empty() {
            return Err(RelayError::Schedule("Task prompt must not be empty".to_string()));
        }
        let now = Utc::now();
        let next_run = compute_next_run(new.schedule_type, &new.schedule_value, now)?;

        let task = ScheduledTask {
            id: format!("task-{}", Uuid::new_v4().simple()),
            group_folder: new.group_folder,
            chat_jid: new.chat_jid,
            prompt: new.prompt,
            schedule_type: new.schedule_type,
            schedule_value: new.schedule_value,
            context_mode: new.context_mode,
            status: TaskStatus::Active,
            next_run,
            last_run: None,
            last_result: None,
            created_at: now,
        };
        TaskRepository::new(&self.inner.ctx.db).insert(&task).await?;

        info!(
            task_id = %task.id,
            group = %task.group_folder,
            schedule_type = %task.schedule_type,
            next_run = ?task.next_run,
            "Task scheduled"
        );
        Ok(task)
    }

    /// Pause an active task. Returns false if it was not active.
    pub async fn pause_task(&self, task_id: &str) -> Result<bool> {
        let repo = TaskRepository::new(&self.inner.ctx.db);
        match repo.get_task(task_id).await? {
            Some(task) if task.status == TaskStatus::Active => {
                repo.update_status(task_id, TaskStatus::Paused).await?;
                info!(task_id, "Task paused");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Resume a paused task, recomputing `next_run` for recurring schedules.
    pub async fn resume_task(&self, task_id: &str) -> Result<bool> {
        let repo = TaskRepository::new(&self.inner.ctx.db);
        let Some(task) = repo.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Paused {
            return Ok(false);
        }

        let next_run = match task.schedule_type {
            ScheduleType::Once => task.next_run,
            _ => compute_next_run(task.schedule_type, &task.schedule_value, Utc::now())?,
        };
        repo.update_schedule(task_id, TaskStatus::Active, next_run)
            .await?;
        info!(task_id, next_run = ?next_run, "Task resumed");
        Ok(true)
    }

    /// Cancel a task. Cancellation is terminal.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let repo = TaskRepository::new(&self.inner.ctx.db);
        match repo.get_task(task_id).await? {
            Some(task) if !task.status.is_terminal() => {
                repo.update_status(task_id, TaskStatus::Cancelled).await?;
                info!(task_id, "Task cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        TaskRepository::new(&self.inner.ctx.db)
            .get_task(task_id)
            .await
    }

    /// Tasks of one folder, or every task.
    pub async fn list_tasks(&self, folder: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let repo = TaskRepository::new(&self.inner.ctx.db);
        match folder {
            Some(folder) => repo.get_by_folder(folder).await,
            None => repo.get_all().await,
        }
    }

    pub async fn run_history(&self, task_id: &str) -> Result<Vec<TaskRun>> {
        TaskRunRepository::new(&self.inner.ctx.db)
            .list_for_task(task_id)
            .await
    }

    /// Number of task runs currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .map(|set| set.len())
            .unwrap_or_default()
    }
}

/// Removes a task id from the in-flight set when its run ends, even by panic.
struct InFlightGuard {
    inner: Arc<SchedulerInner>,
    task_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.task_id);
    }
}

impl SchedulerInner {
    async fn tick(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let due = TaskRepository::new(&self.ctx.db).get_due(Utc::now()).await?;
        let mut started = Vec::new();

        for task in due {
            {
                let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !set.insert(task.id.clone()) {
                    debug!(task_id = %task.id, "Task still running, skipping");
                    continue;
                }
            }
            let guard = InFlightGuard {
                inner: self.clone(),
                task_id: task.id.clone(),
            };
            let inner = self.clone();
            started.push(tokio::spawn(async move {
                let _guard = guard;
                inner.run_task(task).await;
            }));
        }

        Ok(started)
    }

    async fn run_task(&self, selected: ScheduledTask) {
        let ctx = &self.ctx;
        let _lock = ctx.locks.lock(&selected.group_folder).await;

        let repo = TaskRepository::new(&ctx.db);
        let task = match repo.get_task(&selected.id).await {
            Ok(Some(task)) if task.status == TaskStatus::Active => task,
            Ok(_) => {
                debug!(task_id = %selected.id, "Task no longer active, skipping run");
                return;
            }
            Err(e) => {
                error!(task_id = %selected.id, error = %e, "Failed to reload task");
                return;
            }
        };

        let run_at = Utc::now();
        let started = Instant::now();

        let Some(group) = ctx.registry.get_by_folder(&task.group_folder).await else {
            // Left due on purpose: the run is retried once the folder is registered.
            let message = format!("Group not found: {}", task.group_folder);
            warn!(task_id = %task.id, group = %task.group_folder, "Task owner not registered");
            self.record_run(&task, run_at, started, &InvocationResult::error(message))
                .await;
            return;
        };

        info!(task_id = %task.id, group = %task.group_folder, "Running scheduled task");

        let sessions = SessionRepository::new(&ctx.db);
        let session_id = match task.context_mode {
            ContextMode::Group => sessions.get_session(&task.group_folder).await.unwrap_or_else(|e| {
                warn!(task_id = %task.id, error = %e, "Failed to load session");
                None
            }),
            ContextMode::Isolated => None,
        };

        let result = match prepare_container_launch(&ctx.config, &ctx.db, &group).await {
            Ok(()) => {
                let request = InvocationRequest {
                    prompt: task.prompt.clone(),
                    session_id,
                    group_folder: task.group_folder.clone(),
                    chat_jid: task.chat_jid.clone(),
                    is_main: false,
                    is_scheduled_task: true,
                    attachment: None,
                };
                ctx.executor.execute(&group, request).await
            }
            Err(e) => InvocationResult::error(format!("Failed to prepare invocation: {e}")),
        };

        if result.is_success() && task.context_mode == ContextMode::Group {
            if let Some(session) = &result.new_session_id {
                if let Err(e) = sessions.set_session(&task.group_folder, session).await {
                    warn!(task_id = %task.id, error = %e, "Failed to persist session");
                }
            }
        }

        self.record_run(&task, run_at, started, &result).await;

        let mut summary = run_summary(&result);
        let (next_run, status) = match task.schedule_type {
            ScheduleType::Once => (None, Some(TaskStatus::Completed)),
            _ => match compute_next_run(task.schedule_type, &task.schedule_value, Utc::now()) {
                Ok(next) => (next, None),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Unparsable schedule, pausing task");
                    summary = e.to_string();
                    (None, Some(TaskStatus::Paused))
                }
            },
        };

        if let Err(e) = repo
            .update_after_run(&task.id, next_run, run_at, &summary, status)
            .await
        {
            error!(task_id = %task.id, error = %e, "Failed to persist task outcome");
        }

        if let Some(text) = result
            .result
            .as_deref()
            .filter(|t| result.is_success() && !t.trim().is_empty())
        {
            if let Err(e) = ctx.router.send_message(&task.chat_jid, text).await {
                warn!(task_id = %task.id, error = %e, "Failed to forward task result");
            }
        }

        info!(
            task_id = %task.id,
            status = result.status.as_str(),
            next_run = ?next_run,
            "Scheduled task finished"
        );
    }

    async fn record_run(
        &self,
        task: &ScheduledTask,
        run_at: DateTime<Utc>,
        started: Instant,
        result: &InvocationResult,
    ) {
        let run = TaskRun {
            id: None,
            task_id: task.id.clone(),
            run_at,
            duration_ms: started.elapsed().as_millis() as i64,
            status: result.status,
            result: result.result.clone(),
            error: result.error.clone(),
        };
        if let Err(e) = TaskRunRepository::new(&self.ctx.db).append(&run).await {
            error!(task_id = %task.id, error = %e, "Failed to record task run");
        }
    }
}

/// Text stored as `last_result` after a run.
fn run_summary(result: &InvocationResult) -> String {
    match result.status {
        RunStatus::Error => result
            .error
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string()),
        RunStatus::Success => match result.result.as_deref() {
            Some(text) if !text.trim().is_empty() => text.chars().take(SUMMARY_MAX_CHARS).collect(),
            _ => "Completed".to_string(),
        },
    }
}

/// Next run time of a schedule evaluated at `now`.
///
/// Cron expressions use host local time; intervals are milliseconds (or carry
/// an `ms`/`s`/`m`/`h`/`d` suffix); `once` is an RFC 3339 timestamp or a
/// local `YYYY-MM-DDTHH:MM:SS`.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Cron => cron_next(value, now).map(Some),
        ScheduleType::Interval => Ok(Some(now + parse_interval(value)?)),
        ScheduleType::Once => parse_once(value).map(Some),
    }
}

/// Convert 5-field cron to 7-field and find the next occurrence after `now`.
///
/// The `cron` crate expects: sec min hour dom month dow year.
fn cron_next(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = fields.join(" ");
    let cron_expr = match fields.len() {
        5 => format!("0 {normalized} *"),
        6 => format!("{normalized} *"),
        7 => normalized,
        _ => {
            return Err(RelayError::Schedule(format!(
                "Invalid cron expression (expected 5-7 fields): {expr}"
            )));
        }
    };

    let schedule = cron::Schedule::from_str(&cron_expr)
        .map_err(|e| RelayError::Schedule(format!("Invalid cron expression '{expr}': {e}")))?;

    schedule
        .after(&now.with_timezone(&Local))
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| RelayError::Schedule(format!("Cron expression never fires: {expr}")))
}

/// Parse intervals like "60000", "500ms", "60s", "5m", "2h", "1d".
fn parse_interval(value: &str) -> Result<chrono::Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let invalid = || {
        RelayError::Schedule(format!(
            "Invalid interval: '{value}'. Expected milliseconds or 500ms, 60s, 5m, 2h, 1d"
        ))
    };
    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(RelayError::Schedule(format!(
            "Interval must be positive: '{value}'"
        )));
    }

    let duration = match unit {
        "" | "ms" => chrono::Duration::try_milliseconds(amount),
        "s" => chrono::Duration::try_seconds(amount),
        "m" => chrono::Duration::try_minutes(amount),
        "h" => chrono::Duration::try_hours(amount),
        "d" => chrono::Duration::try_days(amount),
        _ => None,
    };
    duration.ok_or_else(invalid)
}

fn parse_once(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| RelayError::Schedule(format!("Invalid timestamp for once task: '{value}'")))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| RelayError::Schedule(format!("Nonexistent local time: '{value}'")))
}
