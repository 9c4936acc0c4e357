use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// A set of async mutexes addressed by string key.
///
/// Holders of the same key are serialized; different keys never contend.
/// The map only keeps weak references, so a key's mutex is freed once the
/// last guard and waiter for it are gone.
#[derive(Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Held lock for one key; releases on drop.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock for `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.mutex_for(key);
        if mutex.try_lock().is_err() {
            debug!(%key, "waiting for in-flight operation on the same key");
        }
        KeyGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    fn mutex_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        entries.retain(|_, weak| weak.strong_count() > 0);
        let mutex = Arc::new(AsyncMutex::new(()));
        entries.insert(key.to_string(), Arc::downgrade(&mutex));
        mutex
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}
