pub mod container;
pub mod enums;
pub mod error;
pub mod group;
pub mod ipc;
pub mod message;
pub mod task;

// Re-exports for convenience
pub use container::{Attachment, InvocationRequest, InvocationResult};
pub use enums::{ContextMode, RunStatus, ScheduleType, TaskStatus};
pub use error::{RelayError, Result};
pub use group::{AdditionalMount, ContainerConfig, RegisteredGroup};
pub use ipc::{IpcEnvelope, IpcRequest};
pub use message::InboundMessage;
pub use task::{NewTask, ScheduledTask, TaskRun, TaskSnapshot};
