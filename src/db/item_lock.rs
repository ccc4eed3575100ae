use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<i32, Arc<Mutex<()>>>;

/// Per-key async locks used to serialize read-decide-write sequences on a single row.
///
/// Callers holding different keys never wait on each other. The guard must be taken before
/// a pooled connection is acquired, otherwise waiters can starve the pool.
#[derive(Debug, Clone, Default)]
pub struct ItemLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one key; dropping it releases the key and forgets it once nobody waits.
#[derive(Debug)]
pub struct ItemLockGuard {
    key: i32,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: i32) -> ItemLockGuard {
        let lock = Arc::clone(
            self.locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        ItemLockGuard {
            key,
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }
}

impl Drop for ItemLockGuard {
    fn drop(&mut self) {
        // The owned guard holds its own Arc to the mutex; release it first so an idle entry
        // is left with only the map's reference.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
