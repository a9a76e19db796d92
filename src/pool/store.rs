//! Persisted key-value store - the system of record for the pool
//!
//! The pool only needs get/set/remove/list-keys on JSON values, plus a named
//! lock primitive. Two backends are provided:
//! - [`MemoryStore`] for a single process (tests, embedded use)
//! - [`FileStore`] for several processes sharing a directory

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};
use uuid::Uuid;

use super::lock::LockOwner;

/// Errors from the backing store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Unavailable(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows swapping backends)
// ============================================================================

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Returns whether the key existed
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`, sorted
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Take the named lock for `owner`; false when someone else holds it
    fn try_lock(&self, name: &str, owner: &LockOwner) -> Result<bool, StoreError>;

    /// Release the named lock if `owner` holds it
    fn unlock(&self, name: &str, owner: &LockOwner) -> Result<bool, StoreError>;
}

/// Run store work that may block on the filesystem
///
/// On a multi-threaded runtime the worker hands its other tasks off first.
/// A current-thread runtime, or no runtime at all, runs `op` inline.
pub fn offload<T>(op: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(op)
        }
        _ => op(),
    }
}

/// Read and decode a typed value
pub fn load<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encode and write a typed value
pub fn save<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<(), StoreError> {
    store.set(key, serde_json::to_value(value)?)
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
    locks: DashMap<String, LockOwner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.remove(key).is_some())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn try_lock(&self, name: &str, owner: &LockOwner) -> Result<bool, StoreError> {
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(owner.clone());
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    fn unlock(&self, name: &str, owner: &LockOwner) -> Result<bool, StoreError> {
        Ok(self
            .locks
            .remove_if(name, |_, holder| holder.token == owner.token)
            .is_some())
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Unreadable lock files younger than this are left alone
pub const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(10);

/// One JSON file per key under `<root>/data`, lock files under `<root>/locks`
///
/// File names are the SHA-256 of the key; each record stores its own key so
/// `list_keys` can recover it. Writes go through a temp file and a rename.
///
/// A lock file is published with `hard_link`, so it never exists without its
/// holder record. Stale locks are only removed by a breaker holding the
/// sibling `.break` file; plain acquirers never delete anything.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    stale_grace: Duration,
}

/// What a lock file currently says
#[derive(Debug, Clone, PartialEq)]
enum LockState {
    Free,
    Held(LockOwner),
    /// Present but not a holder record, with its modification time
    Unreadable(SystemTime),
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    value: Value,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("data"))?;
        fs::create_dir_all(root.join("locks"))?;
        debug!("Opened file store at {}", root.display());
        Ok(Self {
            root,
            stale_grace: DEFAULT_STALE_GRACE,
        })
    }

    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join("data").join(format!("{}.json", hash_key(key)))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", hash_key(name)))
    }

    fn read_lock(&self, path: &Path) -> Result<LockState, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(e.into()),
        };
        if let Ok(owner) = serde_json::from_str(&content) {
            return Ok(LockState::Held(owner));
        }
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => Ok(LockState::Unreadable(modified)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LockState::Free),
            Err(e) => Err(e.into()),
        }
    }

    /// A local holder whose process is gone, or garbage past the grace period
    fn is_stale(&self, state: &LockState) -> bool {
        match state {
            LockState::Free => false,
            LockState::Held(holder) => holder.is_local() && !process_alive(holder.pid),
            LockState::Unreadable(modified) => modified
                .elapsed()
                .map_or(self.stale_grace.is_zero(), |age| age >= self.stale_grace),
        }
    }

    /// Publish `owner` at `path` unless the file already exists
    fn create_lock_file(&self, path: &Path, owner: &LockOwner) -> Result<bool, StoreError> {
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(serde_json::to_string(owner)?.as_bytes())?;
        file.sync_all()?;
        drop(file);

        let linked = match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        };
        remove_if_present(&tmp)?;
        linked
    }

    /// Swap a stale lock for our own while holding the `.break` file
    fn break_stale(&self, name: &str, path: &Path, owner: &LockOwner) -> Result<bool, StoreError> {
        let breaker = path.with_extension("break");
        if !self.create_lock_file(&breaker, owner)? {
            // A breaker that died mid-break would block every later one
            let state = self.read_lock(&breaker)?;
            if self.is_stale(&state) {
                self.discard_if_unchanged(&breaker, &state)?;
            }
            return Ok(false);
        }

        let replaced = self.replace_if_stale(name, path, owner);
        let released = remove_if_present(&breaker);
        let replaced = replaced?;
        released?;
        Ok(replaced)
    }

    fn replace_if_stale(&self, name: &str, path: &Path, owner: &LockOwner) -> Result<bool, StoreError> {
        // Re-read under the breaker: another breaker may have got here first
        let state = self.read_lock(path)?;
        match &state {
            LockState::Free => {}
            LockState::Held(holder) if self.is_stale(&state) => warn!(
                "Breaking stale lock '{}' held by pid {} since {}",
                name, holder.pid, holder.acquired_at
            ),
            LockState::Unreadable(_) if self.is_stale(&state) => {
                warn!("Breaking unreadable lock '{}'", name)
            }
            _ => return Ok(false),
        }
        remove_if_present(path)?;
        self.create_lock_file(path, owner)
    }

    /// Remove `path` only if it still holds the lock `observed` described
    fn discard_if_unchanged(&self, path: &Path, observed: &LockState) -> Result<(), StoreError> {
        let aside = path.with_extension(format!("stale-{}", Uuid::new_v4()));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let unchanged = match (self.read_lock(&aside)?, observed) {
            (LockState::Held(moved), LockState::Held(seen)) => moved.token == seen.token,
            (LockState::Unreadable(_), LockState::Unreadable(_)) => true,
            _ => false,
        };
        if !unchanged {
            // Someone else's fresh file; put it back unless the slot was retaken
            match fs::hard_link(&aside, path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        remove_if_present(&aside)
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match fs::read_to_string(self.data_path(key)) {
            Ok(content) => {
                let record: FileRecord = serde_json::from_str(&content)?;
                Ok(Some(record.value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.data_path(key);
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let record = FileRecord {
            key: key.to_string(),
            value,
        };
        fs::write(&tmp, serde_json::to_vec(&record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.data_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(self.root.join("data"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                // Removed between read_dir and read
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let record: FileRecord = serde_json::from_str(&content)?;
            if record.key.starts_with(prefix) {
                keys.push(record.key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn try_lock(&self, name: &str, owner: &LockOwner) -> Result<bool, StoreError> {
        let path = self.lock_path(name);
        if self.create_lock_file(&path, owner)? {
            return Ok(true);
        }

        // A holder on this host whose process is gone will never release
        let state = self.read_lock(&path)?;
        match state {
            LockState::Free => self.create_lock_file(&path, owner),
            _ if self.is_stale(&state) => self.break_stale(name, &path, owner),
            _ => Ok(false),
        }
    }

    fn unlock(&self, name: &str, owner: &LockOwner) -> Result<bool, StoreError> {
        let path = self.lock_path(name);
        match self.read_lock(&path)? {
            LockState::Held(holder) if holder.token == owner.token => {
                fs::remove_file(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
