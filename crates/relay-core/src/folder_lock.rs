use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per working folder.
///
/// Held around every agent invocation so a folder never has two runs at once,
/// whether the run came from chat input or from the scheduler.
#[derive(Default)]
pub struct FolderLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FolderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, folder: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(folder.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `folder`.
    pub async fn lock(&self, folder: &str) -> OwnedMutexGuard<()> {
        self.entry(folder).lock_owned().await
    }

    /// Whether an invocation currently holds `folder`.
    pub fn is_busy(&self, folder: &str) -> bool {
        self.entry(folder).try_lock().is_err()
    }

    /// Number of folders with an invocation in flight.
    pub fn busy_count(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|m| m.try_lock().is_err()).count()
    }
}
