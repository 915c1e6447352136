use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{ContextMode, ScheduleType};

/// Side-effecting request an agent drops into its mailbox.
///
/// Field casing is mixed on the wire. Identifiers are camelCase (`chatJid`,
/// `taskId`, `targetFolder`) while the schedule fields stay snake_case
/// (`schedule_type`, `schedule_value`, `context_mode`):
///
/// ```json
/// {"type": "schedule_task", "prompt": "Post the summary", "schedule_type": "cron",
///  "schedule_value": "0 9 * * 1", "context_mode": "group", "targetFolder": "acme"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Message {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        text: String,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        #[serde(default)]
        context_mode: ContextMode,
        /// Folder that will own the task; defaults to the creating folder.
        #[serde(
            rename = "targetFolder",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        target_folder: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
}

impl IpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ScheduleTask { .. } => "schedule_task",
            Self::PauseTask { .. } => "pause_task",
            Self::ResumeTask { .. } => "resume_task",
            Self::CancelTask { .. } => "cancel_task",
        }
    }

    /// Mailbox subdirectory this request belongs in.
    pub fn mailbox(&self) -> &'static str {
        match self {
            Self::Message { .. } => "messages",
            _ => "tasks",
        }
    }
}

/// One mailbox file: the request plus the sender's self-description.
///
/// `group_folder` and `is_main` are informational only; the host derives both
/// from the mailbox directory the file was found in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcEnvelope {
    #[serde(flatten)]
    pub request: IpcRequest,
    #[serde(rename = "groupFolder", default)]
    pub group_folder: String,
    #[serde(rename = "isMain", default)]
    pub is_main: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl IpcEnvelope {
    pub fn new(request: IpcRequest, group_folder: impl Into<String>, is_main: bool) -> Self {
        Self {
            request,
            group_folder: group_folder.into(),
            is_main,
            timestamp: Utc::now(),
        }
    }
}
