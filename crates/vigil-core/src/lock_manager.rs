//! Named mutexes for task handlers
//!
//! Handlers use these for their own cross-task serialization, e.g. "only one
//! certificate request in flight". They are unrelated to the per-task claim
//! that guarantees a single in-flight attempt, and they are process-local.

use crate::error::{Result, VigilError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Default lock acquisition timeout (30 seconds)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Entries are pruned once the table grows past this many names
const PRUNE_THRESHOLD: usize = 1024;

/// Registry of async mutexes keyed by name
///
/// Locking the same name from two handlers serializes them; different names
/// never contend. Acquisition is bounded by a timeout instead of blocking
/// indefinitely.
///
/// # Example
///
/// ```ignore
/// let locks = LockManager::new(Duration::from_secs(5));
/// let _guard = locks.lock("certbot:request").await?;
/// // critical section
/// ```
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    default_timeout: Duration,
}

/// Guard for a held named mutex; the lock is released on drop
pub struct NamedMutexGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedMutexGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl LockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > PRUNE_THRESHOLD {
            // Only the map holds an unlocked entry with a strong count of 1
            locks.retain(|_, m| Arc::strong_count(m) > 1 || m.try_lock().is_err());
        }
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the named mutex with the default timeout
    pub async fn lock(&self, name: &str) -> Result<NamedMutexGuard> {
        self.lock_with_timeout(name, self.default_timeout).await
    }

    /// Acquire the named mutex, failing with `LockTimeout` after `timeout`
    pub async fn lock_with_timeout(&self, name: &str, timeout: Duration) -> Result<NamedMutexGuard> {
        let mutex = self.entry(name);
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(NamedMutexGuard {
                name: name.to_string(),
                _guard: guard,
            }),
            Err(_) => Err(VigilError::LockTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Acquire the named mutex only if it is free right now
    pub fn try_lock(&self, name: &str) -> Option<NamedMutexGuard> {
        let mutex = self.entry(name);
        mutex.try_lock_owned().ok().map(|guard| NamedMutexGuard {
            name: name.to_string(),
            _guard: guard,
        })
    }

    /// Whether some holder currently has the named mutex
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .get(name)
            .is_some_and(|m| m.try_lock().is_err())
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS))
    }
}
