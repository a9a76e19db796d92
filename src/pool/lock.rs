//! Named pool lock - serializes every mutating pool operation
//!
//! `PoolLock::acquire` waits until the store grants the named lock and hands
//! back a [`PoolGuard`]. Mutating inventory and allocator methods take
//! `&PoolGuard`, so a critical section cannot be entered by accident. The
//! guard unlocks on drop; `release` does the same and reports store errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error};
use uuid::Uuid;

use super::store::{offload, KvStore, StoreError};

pub const DEFAULT_LOCK_NAME: &str = "node-pool-operation";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Identity of a lock holder
///
/// Every acquisition gets a fresh token, so two tasks of one process exclude
/// each other just like two processes do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub token: Uuid,
    pub host: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    pub fn current() -> Self {
        Self {
            token: Uuid::new_v4(),
            host: local_hostname(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the holder runs on this machine
    pub fn is_local(&self) -> bool {
        self.host == local_hostname()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Clone)]
pub struct PoolLock {
    store: Arc<dyn KvStore>,
    name: String,
    poll_interval: Duration,
}

impl PoolLock {
    pub fn new(store: Arc<dyn KvStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the lock. There is no timeout.
    pub async fn acquire(&self) -> Result<PoolGuard, StoreError> {
        let owner = LockOwner::current();
        let mut waited = 0u32;
        loop {
            if offload(|| self.store.try_lock(&self.name, &owner))? {
                debug!(lock = %self.name, waited, "Acquired pool lock");
                return Ok(self.guard(owner));
            }
            if waited == 0 {
                debug!(lock = %self.name, "Waiting for pool lock");
            }
            waited += 1;
            sleep(self.poll_interval).await;
        }
    }

    /// Single attempt; `None` when the lock is held elsewhere
    pub fn try_acquire(&self) -> Result<Option<PoolGuard>, StoreError> {
        let owner = LockOwner::current();
        if self.store.try_lock(&self.name, &owner)? {
            Ok(Some(self.guard(owner)))
        } else {
            Ok(None)
        }
    }

    fn guard(&self, owner: LockOwner) -> PoolGuard {
        PoolGuard {
            store: Arc::clone(&self.store),
            name: self.name.clone(),
            owner,
            released: false,
        }
    }
}

/// Proof of holding the pool lock
pub struct PoolGuard {
    store: Arc<dyn KvStore>,
    name: String,
    owner: LockOwner,
    released: bool,
}

impl PoolGuard {
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.unlock(&self.name, &self.owner)?;
        debug!(lock = %self.name, "Released pool lock");
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.unlock(&self.name, &self.owner) {
            error!("Failed to release pool lock '{}': {}", self.name, e);
        }
    }
}
