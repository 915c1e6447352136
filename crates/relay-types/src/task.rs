use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{ContextMode, RunStatus, ScheduleType, TaskStatus};

/// Scheduled task configuration and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub context_mode: ContextMode,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a task; id, status and `next_run` are assigned on creation.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
}

/// Append-only audit record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    #[serde(default)]
    pub id: Option<i64>,
    pub task_id: String,
    pub run_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Entry of the `current_tasks.json` snapshot published into a mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(rename = "groupFolder")]
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub status: TaskStatus,
    pub next_run: Option<DateTime<Utc>>,
}

impl From<&ScheduledTask> for TaskSnapshot {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            id: task.id.clone(),
            group_folder: task.group_folder.clone(),
            prompt: task.prompt.clone(),
            schedule_type: task.schedule_type,
            schedule_value: task.schedule_value.clone(),
            status: task.status,
            next_run: task.next_run,
        }
    }
}
