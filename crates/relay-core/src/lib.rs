pub mod formatting;
pub mod logging;
pub mod security;
pub mod utils;

// Runtime services
pub mod container_prep;
pub mod container_runner;
pub mod context;
pub mod folder_lock;
pub mod group_queue;
pub mod ipc;
pub mod mount_security;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod task_scheduler;

pub use formatting::{escape_xml, format_messages_xml, strip_internal};
pub use logging::init_logging;
pub use security::{check_path_traversal, validate_folder_name};
pub use utils::{write_atomic, GracefulShutdown};

pub use container_prep::{prepare_container_launch, write_tasks_snapshot, TASKS_SNAPSHOT_FILE};
pub use container_runner::{build_run_args, parse_invocation_output, AgentExecutor, ContainerRunner};
pub use context::RunContext;
pub use folder_lock::FolderLocks;
pub use group_queue::{GroupQueue, QueueSettings};
pub use ipc::{write_envelope, IpcBridge};
pub use mount_security::{build_mounts, MountMode, MountSpec};
pub use orchestrator::{HealthStatus, Orchestrator};
pub use registry::GroupRegistry;
pub use router::{build_trigger_regex, ChannelSender, MessageRouter, RouteAction};
pub use task_scheduler::{compute_next_run, TaskScheduler};
