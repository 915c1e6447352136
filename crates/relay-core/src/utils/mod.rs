pub mod atomic_write;
pub mod shutdown;

pub use atomic_write::write_atomic;
pub use shutdown::GracefulShutdown;
