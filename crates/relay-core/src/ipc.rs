//! File-based mailboxes between agent processes and the host.
//!
//! Agents drop JSON envelopes into `ipc/<folder>/messages/` and
//! `ipc/<folder>/tasks/`. The host polls those directories, authorizes each
//! request against the folder it was found in, and dispatches it.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use relay_config::Config;
use relay_types::{IpcEnvelope, IpcRequest, NewTask, RelayError, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::GroupRegistry;
use crate::router::MessageRouter;
use crate::task_scheduler::TaskScheduler;
use crate::utils::write_atomic;

const MAILBOXES: [&str; 2] = ["messages", "tasks"];
const ERRORS_DIR: &str = "errors";
/// Dispatched envelope keys remembered to avoid redelivery.
const PROCESSED_CAPACITY: usize = 4096;

/// Write `envelope` into the matching mailbox under `ipc_root`.
///
/// The file only becomes visible under its final `{epoch-ms}-{suffix}.json`
/// name once fully written.
pub async fn write_envelope(ipc_root: &Path, envelope: &IpcEnvelope) -> Result<PathBuf> {
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!("{}-{}.json", Utc::now().timestamp_millis(), &suffix[..8]);
    let content = serde_json::to_vec_pretty(envelope)?;
    let dir = ipc_root.join(envelope.request.mailbox());
    write_atomic(&dir, &name, &content).await
}

/// Polls every folder's mailbox and applies the requests it finds.
pub struct IpcBridge {
    inner: Arc<BridgeInner>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

struct BridgeInner {
    ipc_dir: PathBuf,
    registry: Arc<GroupRegistry>,
    router: Arc<MessageRouter>,
    scheduler: Arc<TaskScheduler>,
    processed: Mutex<LruCache<String, ()>>,
}

impl IpcBridge {
    pub fn new(
        config: &Config,
        registry: Arc<GroupRegistry>,
        router: Arc<MessageRouter>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        let capacity = NonZeroUsize::new(PROCESSED_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(BridgeInner {
                ipc_dir: config.ipc_dir(),
                registry,
                router,
                scheduler,
                processed: Mutex::new(LruCache::new(capacity)),
            }),
            poll_interval: Duration::from_millis(config.ipc_poll_interval_ms),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("IPC bridge is already running");
            return;
        }

        let running = self.running.clone();
        let inner = self.inner.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            info!(dir = %inner.ipc_dir.display(), "IPC bridge started");
            while running.load(Ordering::SeqCst) {
                match tokio::spawn(inner.clone().poll()).await {
                    Ok(Ok(n)) if n > 0 => debug!(count = n, "IPC envelopes processed"),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "IPC poll failed"),
                    Err(e) => error!(error = %e, "IPC poll panicked"),
                }
                tokio::time::sleep(interval).await;
            }
            info!("IPC bridge stopped");
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
        info!("IPC bridge stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Process every envelope currently in the mailboxes. Returns how many were handled.
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.clone().poll().await
    }
}

impl BridgeInner {
    async fn poll(self: Arc<Self>) -> Result<usize> {
        let mut handled = 0;
        for folder in self.list_folders().await? {
            for mailbox in MAILBOXES {
                let dir = self.ipc_dir.join(&folder).join(mailbox);
                for path in list_envelopes(&dir).await {
                    self.process_file(&folder, mailbox, &path).await;
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }

    async fn list_folders(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.ipc_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::Ipc(format!("Failed to list IPC dir: {e}"))),
        };

        let mut folders = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_dir && name != ERRORS_DIR && !name.starts_with('.') {
                folders.push(name);
            }
        }
        folders.sort();
        Ok(folders)
    }

    async fn process_file(&self, folder: &str, mailbox: &str, path: &Path) {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let key = format!("{folder}/{mailbox}/{file_name}");

        if self.was_processed(&key) {
            debug!(file = %key, "Envelope already dispatched, removing");
            remove_envelope(path).await;
            return;
        }

        let envelope = match read_envelope(path).await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.archive(folder, path, &e).await;
                return;
            }
        };

        let kind = envelope.request.kind();
        let is_main = self.registry.is_main_folder(folder).await;
        match self.dispatch(folder, is_main, envelope.request).await {
            Ok(()) => {
                debug!(group = folder, kind, file = %file_name, "Envelope dispatched");
                self.mark_processed(key);
                remove_envelope(path).await;
            }
            Err(e) => self.archive(folder, path, &e).await,
        }
    }

    /// Apply one request from `folder`. `is_main` comes from the registry.
    async fn dispatch(&self, folder: &str, is_main: bool, request: IpcRequest) -> Result<()> {
        match request {
            IpcRequest::Message { chat_jid, text } => {
                let owns_chat = self
                    .registry
                    .get(&chat_jid)
                    .await
                    .is_some_and(|g| g.folder == folder);
                if !is_main && !owns_chat {
                    return Err(RelayError::Security(format!(
                        "Folder '{folder}' may not message {chat_jid}"
                    )));
                }
                self.router.send_message(&chat_jid, &text).await
            }
            IpcRequest::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_folder,
            } => {
                let target = target_folder.unwrap_or_else(|| folder.to_string());
                if target != folder && !is_main {
                    return Err(RelayError::Security(format!(
                        "Folder '{folder}' may not schedule tasks for '{target}'"
                    )));
                }
                let Some(group) = self.registry.get_by_folder(&target).await else {
                    return Err(RelayError::Schedule(format!(
                        "Cannot schedule task for unregistered folder '{target}'"
                    )));
                };
                let task = self
                    .scheduler
                    .create_task(NewTask {
                        group_folder: target,
                        chat_jid: group.jid,
                        prompt,
                        schedule_type,
                        schedule_value,
                        context_mode,
                    })
                    .await?;
                info!(task_id = %task.id, source = folder, "Task scheduled via IPC");
                Ok(())
            }
            IpcRequest::PauseTask { task_id } => {
                self.authorize_task(folder, is_main, &task_id).await?;
                let changed = self.scheduler.pause_task(&task_id).await?;
                debug!(task_id = %task_id, changed, "Pause requested via IPC");
                Ok(())
            }
            IpcRequest::ResumeTask { task_id } => {
                self.authorize_task(folder, is_main, &task_id).await?;
                let changed = self.scheduler.resume_task(&task_id).await?;
                debug!(task_id = %task_id, changed, "Resume requested via IPC");
                Ok(())
            }
            IpcRequest::CancelTask { task_id } => {
                self.authorize_task(folder, is_main, &task_id).await?;
                let changed = self.scheduler.cancel_task(&task_id).await?;
                debug!(task_id = %task_id, changed, "Cancel requested via IPC");
                Ok(())
            }
        }
    }

    async fn authorize_task(&self, folder: &str, is_main: bool, task_id: &str) -> Result<()> {
        let Some(task) = self.scheduler.get_task(task_id).await? else {
            return Err(RelayError::Schedule(format!("Task not found: {task_id}")));
        };
        if !is_main && task.group_folder != folder {
            return Err(RelayError::Security(format!(
                "Folder '{folder}' may not manage task {task_id}"
            )));
        }
        Ok(())
    }

    /// Move a rejected envelope to `ipc/errors/<folder>-<file>` so it is not retried.
    async fn archive(&self, folder: &str, path: &Path, reason: &RelayError) {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        warn!(group = folder, file = %file_name, error = %reason, "Rejected IPC envelope");

        let errors_dir = self.ipc_dir.join(ERRORS_DIR);
        let target = errors_dir.join(format!("{folder}-{file_name}"));
        let moved = match tokio::fs::create_dir_all(&errors_dir).await {
            Ok(()) => tokio::fs::rename(path, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = moved {
            error!(file = %file_name, error = %e, "Failed to archive envelope, deleting");
            remove_envelope(path).await;
        }
    }

    fn was_processed(&self, key: &str) -> bool {
        let mut processed = self.processed.lock().unwrap_or_else(|e| e.into_inner());
        processed.get(key).is_some()
    }

    fn mark_processed(&self, key: String) {
        let mut processed = self.processed.lock().unwrap_or_else(|e| e.into_inner());
        processed.put(key, ());
    }
}

/// Final-named `.json` envelopes in `dir`, in filename order. Temp files are skipped.
async fn list_envelopes(dir: &Path) -> Vec<PathBuf> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if !hidden && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    files
}

async fn read_envelope(path: &Path) -> Result<IpcEnvelope> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RelayError::Ipc(format!("Failed to read envelope: {e}")))?;
    serde_json::from_str(&content)
        .map_err(|e| RelayError::Ipc(format!("Malformed envelope: {e}")))
}

async fn remove_envelope(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove envelope");
        }
    }
}
