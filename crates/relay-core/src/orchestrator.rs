use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use relay_config::Config;
use relay_db::Database;
use relay_types::{
    Attachment, InboundMessage, RegisteredGroup, RelayError, Result, TaskStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::container_prep::ensure_group_dirs;
use crate::container_runner::{AgentExecutor, ContainerRunner};
use crate::context::RunContext;
use crate::folder_lock::FolderLocks;
use crate::group_queue::{GroupQueue, QueueSettings};
use crate::ipc::IpcBridge;
use crate::registry::GroupRegistry;
use crate::router::{ChannelSender, MessageRouter, RouteAction};
use crate::task_scheduler::TaskScheduler;

/// System health status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub channels_total: usize,
    pub registered_groups: usize,
    pub queue_workers: usize,
    pub busy_folders: usize,
    pub active_tasks: usize,
    pub running_tasks: usize,
    pub scheduler_running: bool,
    pub ipc_running: bool,
    pub uptime_seconds: f64,
}

/// Main orchestrator that ties all subsystems together.
///
/// Responsible for:
/// - Loading registered groups from DB
/// - Starting/stopping the scheduler, IPC bridge and queue workers
/// - Accepting inbound messages and attachments from channel adapters
/// - Providing health status
pub struct Orchestrator {
    config: Arc<Config>,
    ctx: Arc<RunContext>,
    queue: GroupQueue,
    scheduler: Arc<TaskScheduler>,
    ipc: IpcBridge,
    start_time: Mutex<Option<Instant>>,
    healthy: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator that runs agents in containers.
    pub fn new(config: Config, db: Arc<Database>, channels: Vec<Box<dyn ChannelSender>>) -> Self {
        let config = Arc::new(config);
        let runner = Arc::new(ContainerRunner::new(config.clone()));
        Self::with_executor(config, db, channels, runner)
    }

    /// Create an orchestrator with a custom agent executor.
    pub fn with_executor(
        config: Arc<Config>,
        db: Arc<Database>,
        channels: Vec<Box<dyn ChannelSender>>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        let registry = Arc::new(GroupRegistry::new(db.clone()));
        let router = Arc::new(MessageRouter::new(Arc::new(channels)));
        let ctx = Arc::new(RunContext {
            config: config.clone(),
            db,
            registry: registry.clone(),
            router: router.clone(),
            executor,
            locks: Arc::new(FolderLocks::new()),
        });

        let queue = GroupQueue::new(ctx.clone(), QueueSettings::from_config(&config));
        let scheduler = Arc::new(TaskScheduler::new(ctx.clone()));
        let ipc = IpcBridge::new(&config, registry, router, scheduler.clone());

        Self {
            config,
            ctx,
            queue,
            scheduler,
            ipc,
            start_time: Mutex::new(None),
            healthy: AtomicBool::new(false),
        }
    }

    /// Load registered groups, then start the scheduler and the IPC bridge.
    pub async fn start(&self) -> Result<()> {
        info!("Starting orchestrator");

        let count = self.ctx.registry.load().await?;
        for group in self.ctx.registry.all().await {
            ensure_group_dirs(&self.config, &group.folder).await?;
        }

        self.scheduler.start();
        self.ipc.start();

        self.healthy.store(true, Ordering::SeqCst);
        *self.start_time.lock().await = Some(Instant::now());

        info!(groups = count, "Orchestrator started successfully");
        Ok(())
    }

    /// Stop all subsystems. Pending queue input and in-flight runs are abandoned.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping orchestrator");

        self.scheduler.stop();
        self.ipc.stop();
        self.queue.shutdown();

        self.healthy.store(false, Ordering::SeqCst);
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Accept a message from a channel adapter.
    ///
    /// Messages for unregistered chats are ignored.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<RouteAction> {
        let Some(group) = self.ctx.registry.get(&message.chat_jid).await else {
            debug!(jid = %message.chat_jid, "Message for unregistered chat, ignoring");
            return Ok(RouteAction::Ignore);
        };

        let action = self.ctx.router.classify(&group, &message);
        if action != RouteAction::Ignore {
            self.queue.enqueue(&group.folder, message, action).await?;
        }
        Ok(action)
    }

    /// Stage an attachment for the next run in `chat_jid`'s conversation.
    pub async fn stage_attachment(&self, chat_jid: &str, attachment: Attachment) -> Result<()> {
        let Some(group) = self.ctx.registry.get(chat_jid).await else {
            return Err(RelayError::Channel(format!(
                "Cannot stage attachment for unregistered chat {chat_jid}"
            )));
        };
        self.queue.stage_attachment(&group.folder, attachment).await
    }

    /// Register a group, filling in the default trigger when none is given.
    ///
    /// Only the configured main folder may be registered as privileged.
    pub async fn register_group(&self, mut group: RegisteredGroup) -> Result<RegisteredGroup> {
        if group.is_main && group.folder != self.config.main_group_folder {
            return Err(RelayError::Security(format!(
                "Only folder '{}' may be the main conversation, not '{}'",
                self.config.main_group_folder, group.folder
            )));
        }
        if group.trigger.trim().is_empty() {
            group.trigger = self.config.default_trigger();
        }
        let group = self.ctx.registry.register(group).await?;
        ensure_group_dirs(&self.config, &group.folder).await?;
        Ok(group)
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.ctx.registry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Get current system health status.
    pub async fn health_status(&self) -> HealthStatus {
        let uptime = self
            .start_time
            .lock()
            .await
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let active_tasks = self
            .scheduler
            .list_tasks(None)
            .await
            .map(|tasks| tasks.iter().filter(|t| t.status == TaskStatus::Active).count())
            .unwrap_or(0);

        HealthStatus {
            healthy: self.healthy.load(Ordering::SeqCst),
            channels_total: self.ctx.router.channel_count(),
            registered_groups: self.ctx.registry.len().await,
            queue_workers: self.queue.worker_count(),
            busy_folders: self.ctx.locks.busy_count(),
            active_tasks,
            running_tasks: self.scheduler.in_flight_count(),
            scheduler_running: self.scheduler.is_running(),
            ipc_running: self.ipc.is_running(),
            uptime_seconds: uptime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use relay_types::{ContextMode, NewTask, ScheduleType};

    use crate::context::tests::make_group;
    use crate::group_queue::tests::{message, MockExecutor};
    use crate::router::tests::RecordingChannel;

    struct Harness {
        _tmp: tempfile::TempDir,
        orchestrator: Orchestrator,
        executor: Arc<MockExecutor>,
        sent: Arc<tokio::sync::Mutex<Vec<(String, String)>>>,
        db: Arc<Database>,
    }

    async fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::with_base_dir(tmp.path());
        config.debounce_ms = 50;
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);

        let channel = RecordingChannel::new("tg:");
        let sent = channel.sent.clone();
        let executor = Arc::new(MockExecutor::new(Duration::ZERO));
        let orchestrator = Orchestrator::with_executor(
            Arc::new(config),
            db.clone(),
            vec![Box::new(channel) as Box<dyn ChannelSender>],
            executor.clone(),
        );

        Harness {
            _tmp: tmp,
            orchestrator,
            executor,
            sent,
            db,
        }
    }

    #[tokio::test]
    async fn register_applies_default_trigger() {
        let h = harness().await;
        let mut group = make_group("tg:acme", "acme", false);
        group.trigger = String::new();

        let saved = h.orchestrator.register_group(group).await.unwrap();
        assert_eq!(saved.trigger, "@Andy");
        assert!(h.orchestrator.config.groups_dir.join("acme").is_dir());
        assert!(h.orchestrator.config.ipc_dir().join("acme/tasks").is_dir());
    }

    #[tokio::test]
    async fn only_main_folder_may_be_privileged() {
        let h = harness().await;
        let err = h
            .orchestrator
            .register_group(make_group("tg:acme", "acme", true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("main conversation"), "{err}");
        assert!(h.orchestrator.registry().get("tg:acme").await.is_none());

        let main = h
            .orchestrator
            .register_group(make_group("tg:main", "main", true))
            .await
            .unwrap();
        assert!(main.is_main);
        assert!(h.orchestrator.registry().is_main_folder("main").await);
    }

    #[tokio::test]
    async fn inbound_routed_to_queue() {
        let h = harness().await;
        h.orchestrator
            .register_group(make_group("tg:acme", "acme", false))
            .await
            .unwrap();

        let mut stray = message("s1", "@Andy hi");
        stray.chat_jid = "tg:unknown".to_string();
        assert_eq!(
            h.orchestrator.handle_inbound(stray).await.unwrap(),
            RouteAction::Ignore
        );

        assert_eq!(
            h.orchestrator
                .handle_inbound(message("1", "earlier chatter"))
                .await
                .unwrap(),
            RouteAction::Context
        );
        h.orchestrator
            .stage_attachment(
                "tg:acme",
                Attachment {
                    media_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator
                .handle_inbound(message("2", "@Andy what now?"))
                .await
                .unwrap(),
            RouteAction::Trigger
        );

        for _ in 0..300 {
            if !h.sent.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let requests = h.executor.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("earlier chatter"));
        assert!(requests[0].attachment.is_some());
        assert_eq!(h.sent.lock().await[0].0, "tg:acme");

        assert!(h
            .orchestrator
            .stage_attachment(
                "tg:unknown",
                Attachment {
                    media_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn start_stop_and_health() {
        let h = harness().await;
        // Registered directly in the database before start
        relay_db::GroupRepository::new(&h.db)
            .save_group(&make_group("tg:main", "main", true))
            .await
            .unwrap();

        let idle = h.orchestrator.health_status().await;
        assert!(!idle.healthy);
        assert_eq!(idle.uptime_seconds, 0.0);

        h.orchestrator.start().await.unwrap();
        h.orchestrator
            .scheduler()
            .create_task(NewTask {
                group_folder: "main".to_string(),
                chat_jid: "tg:main".to_string(),
                prompt: "weekly report".to_string(),
                schedule_type: ScheduleType::Once,
                schedule_value: (Utc::now() + chrono::Duration::days(1)).to_rfc3339(),
                context_mode: ContextMode::Isolated,
            })
            .await
            .unwrap();

        let health = h.orchestrator.health_status().await;
        assert!(health.healthy);
        assert!(health.scheduler_running);
        assert!(health.ipc_running);
        assert_eq!(health.registered_groups, 1);
        assert_eq!(health.channels_total, 1);
        assert_eq!(health.active_tasks, 1);
        assert!(h.orchestrator.registry().is_main_folder("main").await);

        h.orchestrator.stop().await.unwrap();
        let stopped = h.orchestrator.health_status().await;
        assert!(!stopped.healthy);
        assert!(!stopped.scheduler_running);
        assert!(!stopped.ipc_running);
    }
}
