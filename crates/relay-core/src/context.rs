use std::sync::Arc;

use relay_config::Config;
use relay_db::Database;

use crate::container_runner::AgentExecutor;
use crate::folder_lock::FolderLocks;
use crate::registry::GroupRegistry;
use crate::router::MessageRouter;

/// Services every agent run needs, shared by the queue workers and the scheduler.
pub struct RunContext {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub registry: Arc<GroupRegistry>,
    pub router: Arc<MessageRouter>,
    pub executor: Arc<dyn AgentExecutor>,
    pub locks: Arc<FolderLocks>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use relay_types::RegisteredGroup;
    use tokio::sync::Mutex;

    use crate::group_queue::tests::MockExecutor;
    use crate::router::tests::RecordingChannel;
    use crate::router::ChannelSender;

    /// A fully wired context on a temp dir with `main`, `acme` and `other` registered.
    pub(crate) struct TestEnv {
        pub tmp: tempfile::TempDir,
        pub ctx: Arc<RunContext>,
        pub executor: Arc<MockExecutor>,
        pub sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    pub(crate) fn make_group(jid: &str, folder: &str, is_main: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            allowed_senders: None,
            container_config: None,
            requires_trigger: true,
            is_main,
            added_at: Utc::now(),
        }
    }

    pub(crate) async fn test_env() -> TestEnv {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::with_base_dir(tmp.path()));
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);

        let registry = Arc::new(GroupRegistry::new(db.clone()));
        for (jid, folder, is_main) in [
            ("tg:main", "main", true),
            ("tg:acme", "acme", false),
            ("tg:other", "other", false),
        ] {
            registry
                .register(make_group(jid, folder, is_main))
                .await
                .unwrap();
        }

        let channel = RecordingChannel::new("tg:");
        let sent = channel.sent.clone();
        let executor = Arc::new(MockExecutor::new(Duration::ZERO));
        let ctx = Arc::new(RunContext {
            config,
            db,
            registry,
            router: Arc::new(MessageRouter::new(Arc::new(vec![
                Box::new(channel) as Box<dyn ChannelSender>
            ]))),
            executor: executor.clone(),
            locks: Arc::new(FolderLocks::new()),
        });

        TestEnv {
            tmp,
            ctx,
            executor,
            sent,
        }
    }
}
