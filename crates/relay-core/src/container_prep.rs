//! Pre-launch preparation for agent containers.
//!
//! Before spawning a container, the host must:
//! 1. Ensure the working folder, session area and mailbox directories exist
//! 2. Publish `current_tasks.json` into the folder's mailbox

use std::path::Path;

use relay_config::Config;
use relay_db::{Database, TaskRepository};
use relay_types::{RegisteredGroup, RelayError, Result, ScheduledTask, TaskSnapshot};
use tracing::debug;

use crate::utils::write_atomic;

pub const TASKS_SNAPSHOT_FILE: &str = "current_tasks.json";

/// Everything that must happen on the host right before an invocation of `group`.
pub async fn prepare_container_launch(
    config: &Config,
    db: &Database,
    group: &RegisteredGroup,
) -> Result<()> {
    ensure_group_dirs(config, &group.folder).await?;
    let tasks = TaskRepository::new(db).get_all().await?;
    write_tasks_snapshot(&config.ipc_dir(), &group.folder, group.is_main, &tasks).await
}

/// Ensure the per-folder directories an invocation mounts.
pub async fn ensure_group_dirs(config: &Config, group_folder: &str) -> Result<()> {
    let ipc_dir = config.ipc_dir().join(group_folder);
    let dirs = [
        config.groups_dir.join(group_folder),
        config.sessions_dir().join(group_folder),
        ipc_dir.join("messages"),
        ipc_dir.join("tasks"),
    ];

    for dir in &dirs {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            RelayError::Container(format!("Failed to create {}: {e}", dir.display()))
        })?;
    }

    debug!(group = group_folder, "Group directories ensured");
    Ok(())
}

/// Atomically write the task snapshot into the folder's mailbox.
///
/// Main sees every task; other folders see only their own.
pub async fn write_tasks_snapshot(
    ipc_dir: &Path,
    group_folder: &str,
    is_main: bool,
    tasks: &[ScheduledTask],
) -> Result<()> {
    let visible: Vec<TaskSnapshot> = tasks
        .iter()
        .filter(|t| is_main || t.group_folder == group_folder)
        .map(TaskSnapshot::from)
        .collect();

    let content = serde_json::to_vec_pretty(&visible)?;
    write_atomic(&ipc_dir.join(group_folder), TASKS_SNAPSHOT_FILE, &content).await?;

    debug!(
        group = group_folder,
        count = visible.len(),
        "Tasks snapshot written"
    );
    Ok(())
}
