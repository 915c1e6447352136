use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use relay_config::Config;
use relay_db::SessionRepository;
use relay_types::{Attachment, InboundMessage, InvocationRequest, RelayError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::container_prep::prepare_container_launch;
use crate::context::RunContext;
use crate::formatting::format_messages_xml;
use crate::router::RouteAction;

/// Inbound ids remembered per conversation for dedupe.
const SEEN_IDS_CAPACITY: usize = 1000;
/// Bound of each conversation's inbound queue.
const QUEUE_CAPACITY: usize = 256;

const ERROR_NOTICE: &str = "Sorry, something went wrong while handling that. Please try again.";

/// Tunables for the per-conversation workers.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub debounce: Duration,
    pub max_pending: usize,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            max_pending: config.max_pending_messages.max(1),
        }
    }
}

enum QueueEvent {
    Inbound {
        message: InboundMessage,
        action: RouteAction,
    },
    StageAttachment(Attachment),
}

struct WorkerHandle {
    tx: mpsc::Sender<QueueEvent>,
    task: JoinHandle<()>,
}

/// Per-conversation debouncing and serialization of agent runs.
///
/// Each working folder gets one worker task that owns its pending messages,
/// staged attachment, seen-id cache and debounce deadline.
pub struct GroupQueue {
    ctx: Arc<RunContext>,
    settings: QueueSettings,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl GroupQueue {
    pub fn new(ctx: Arc<RunContext>, settings: QueueSettings) -> Self {
        Self {
            ctx,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a classified inbound message for `folder`.
    pub async fn enqueue(
        &self,
        folder: &str,
        message: InboundMessage,
        action: RouteAction,
    ) -> Result<()> {
        if action == RouteAction::Ignore {
            return Ok(());
        }
        self.send(folder, QueueEvent::Inbound { message, action })
            .await
    }

    /// Stage an attachment for the next run of `folder`. Last write wins.
    pub async fn stage_attachment(&self, folder: &str, attachment: Attachment) -> Result<()> {
        self.send(folder, QueueEvent::StageAttachment(attachment))
            .await
    }

    async fn send(&self, folder: &str, event: QueueEvent) -> Result<()> {
        let tx = self.sender_for(folder);
        tx.send(event).await.map_err(|_| {
            RelayError::Channel(format!("Queue worker for '{folder}' has stopped"))
        })
    }

    fn sender_for(&self, folder: &str) -> mpsc::Sender<QueueEvent> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = workers.get(folder) {
            if !handle.task.is_finished() {
                return handle.tx.clone();
            }
            warn!(group = folder, "Queue worker exited, restarting");
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = Worker::new(folder.to_string(), self.ctx.clone(), self.settings.clone());
        let task = tokio::spawn(worker.run(rx));
        workers.insert(
            folder.to_string(),
            WorkerHandle {
                tx: tx.clone(),
                task,
            },
        );
        debug!(group = folder, "Queue worker started");
        tx
    }

    /// Number of conversations with a live worker.
    pub fn worker_count(&self) -> usize {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.values().filter(|w| !w.task.is_finished()).count()
    }

    /// Stop every worker, abandoning pending input and in-flight runs.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let count = workers.len();
        for (_, handle) in workers.drain() {
            handle.task.abort();
        }
        info!(count, "Queue workers stopped");
    }
}

/// Messages and attachment consumed by one run.
struct Batch {
    messages: Vec<InboundMessage>,
    attachment: Option<Attachment>,
}

/// Aborts the wrapped task when dropped, so aborting a worker also cancels its run.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Worker {
    folder: String,
    ctx: Arc<RunContext>,
    settings: QueueSettings,
    pending: VecDeque<InboundMessage>,
    has_trigger: bool,
    deadline: Option<Instant>,
    attachment: Option<Attachment>,
    seen: LruCache<String, ()>,
}

impl Worker {
    fn new(folder: String, ctx: Arc<RunContext>, settings: QueueSettings) -> Self {
        let capacity = NonZeroUsize::new(SEEN_IDS_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            folder,
            ctx,
            settings,
            pending: VecDeque::new(),
            has_trigger: false,
            deadline: None,
            attachment: None,
            seen: LruCache::new(capacity),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<QueueEvent>) {
        loop {
            let deadline = self.deadline;
            let debounce = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.accept(event, false),
                    None => break,
                },
                _ = debounce => {
                    if !self.run_until_idle(&mut rx).await {
                        break;
                    }
                }
            }
        }
        debug!(group = %self.folder, "Queue worker stopped");
    }

    fn accept(&mut self, event: QueueEvent, running: bool) {
        match event {
            QueueEvent::Inbound { message, action } => {
                if self.seen.put(message.id.clone(), ()).is_some() {
                    debug!(group = %self.folder, id = %message.id, "Duplicate message dropped");
                    return;
                }

                self.pending.push_back(message);
                while self.pending.len() > self.settings.max_pending {
                    self.pending.pop_front();
                }

                if action == RouteAction::Trigger {
                    self.has_trigger = true;
                    if !running && self.deadline.is_none() {
                        self.deadline = Some(Instant::now() + self.settings.debounce);
                    }
                }
            }
            QueueEvent::StageAttachment(attachment) => {
                if self.attachment.replace(attachment).is_some() {
                    debug!(group = %self.folder, "Staged attachment replaced");
                }
            }
        }
    }

    fn take_batch(&mut self) -> Batch {
        self.has_trigger = false;
        self.deadline = None;
        Batch {
            messages: self.pending.drain(..).collect(),
            attachment: self.attachment.take(),
        }
    }

    /// Run the current batch, then any backlog that arrived meanwhile.
    ///
    /// Returns false once the inbound channel is closed.
    async fn run_until_idle(&mut self, rx: &mut mpsc::Receiver<QueueEvent>) -> bool {
        let mut open = true;
        loop {
            let batch = self.take_batch();
            let run = tokio::spawn(run_batch(self.ctx.clone(), self.folder.clone(), batch));
            let mut run = AbortOnDrop(run);

            loop {
                tokio::select! {
                    outcome = &mut run.0 => {
                        if let Err(e) = outcome {
                            if e.is_panic() {
                                error!(group = %self.folder, error = %e, "Agent run panicked");
                            }
                        }
                        break;
                    }
                    event = rx.recv(), if open => match event {
                        Some(event) => self.accept(event, true),
                        None => open = false,
                    },
                }
            }

            if !self.has_trigger || !open {
                return open;
            }
            debug!(group = %self.folder, backlog = self.pending.len(), "Running backlog");
        }
    }
}

/// One agent run for a folder: prompt, session, snapshot, lock, execute, reply.
async fn run_batch(ctx: Arc<RunContext>, folder: String, batch: Batch) {
    let Some(group) = ctx.registry.get_by_folder(&folder).await else {
        warn!(group = %folder, "Group no longer registered, dropping batch");
        return;
    };
    if batch.messages.is_empty() {
        return;
    }

    let prompt = format_messages_xml(&batch.messages);
    let sessions = SessionRepository::new(&ctx.db);

    let result = {
        let _guard = ctx.locks.lock(&folder).await;
        // Read under the lock: a scheduled run may have just stored a newer session.
        let session_id = match sessions.get_session(&folder).await {
            Ok(id) => id,
            Err(e) => {
                warn!(group = %folder, error = %e, "Failed to load session, starting fresh");
                None
            }
        };
        info!(
            group = %folder,
            messages = batch.messages.len(),
            has_attachment = batch.attachment.is_some(),
            "Starting agent run"
        );

        match prepare_container_launch(&ctx.config, &ctx.db, &group).await {
            Ok(()) => {
                let request = InvocationRequest {
                    prompt,
                    session_id,
                    group_folder: folder.clone(),
                    chat_jid: group.jid.clone(),
                    is_main: group.is_main,
                    is_scheduled_task: false,
                    attachment: batch.attachment,
                };
                ctx.executor.execute(&group, request).await
            }
            Err(e) => relay_types::InvocationResult::error(format!(
                "Failed to prepare invocation: {e}"
            )),
        }
    };

    if result.is_success() {
        if let Some(session) = &result.new_session_id {
            if let Err(e) = sessions.set_session(&folder, session).await {
                warn!(group = %folder, error = %e, "Failed to persist session");
            }
        }
        if let Some(text) = result.result.as_deref().filter(|t| !t.trim().is_empty()) {
            if let Err(e) = ctx.router.send_message(&group.jid, text).await {
                error!(group = %folder, error = %e, "Failed to deliver agent reply");
            }
        }
    } else {
        error!(
            group = %folder,
            error = result.error.as_deref().unwrap_or("unknown error"),
            "Agent run failed"
        );
        if let Err(e) = ctx.router.send_message(&group.jid, ERROR_NOTICE).await {
            warn!(group = %folder, error = %e, "Failed to deliver error notice");
        }
    }
}
