pub mod connection;
pub mod groups;
pub mod sessions;
pub mod task_runs;
pub mod tasks;

pub use connection::Database;
pub use groups::GroupRepository;
pub use sessions::SessionRepository;
pub use task_runs::TaskRunRepository;
pub use tasks::TaskRepository;
