//! Hashed reader/writer lock registry.
//!
//! The registry maps resource keys (normalized absolute paths) to reader/writer
//! locks. Locks are created on first use and kept for the lifetime of the
//! registry, so the map grows with the number of distinct paths touched. The
//! registry is a synchronization primitive, not a cache: entries are never
//! evicted, and an entry is never dropped while a handle on it exists.
//!
//! Each lock admits any number of concurrent readers; a writer excludes readers
//! and other writers on the same key. Keys are independent of each other.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::trace;

use crate::error::LockError;

// =============================================================================
// Resource Key
// =============================================================================

/// Identity of a lockable resource.
///
/// Two keys are equal iff their paths resolve to the same absolute path.
/// Resolution is lexical: relative paths are joined to the current directory
/// and `.`/`..` components are folded. Symlinks are not followed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    path: Arc<Path>,
}

impl ResourceKey {
    /// Build a key from any path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        Self {
            path: Arc::from(normalize(&absolute).as_path()),
        }
    }

    /// The normalized absolute path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&Path> for ResourceKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<&str> for ResourceKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // never climb above the root
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// =============================================================================
// Handles
// =============================================================================

/// Kind of lock held on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// A held read lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct ReadHandle {
    key: ResourceKey,
    _guard: OwnedRwLockReadGuard<()>,
}

impl ReadHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Release the lock now rather than at end of scope.
    pub fn release(self) {
        trace!(key = %self.key, "release read");
    }
}

/// A held write lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct WriteHandle {
    key: ResourceKey,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl WriteHandle {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Release the lock now rather than at end of scope.
    pub fn release(self) {
        trace!(key = %self.key, "release write");
    }
}

// =============================================================================
// Lock Registry
// =============================================================================

/// Process-wide map of per-key reader/writer locks.
///
/// Timeouts follow one convention for both modes:
/// - `None` waits until the lock is granted
/// - `Some(Duration::ZERO)` probes once and fails immediately if unavailable
/// - `Some(d)` waits at most `d`
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<ResourceKey, Arc<RwLock<()>>>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    ///
    /// Created on first use and never torn down.
    pub fn global() -> Arc<LockRegistry> {
        static GLOBAL: OnceLock<Arc<LockRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(LockRegistry::new())).clone()
    }

    fn entry(&self, key: &ResourceKey) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Take a shared lock on `key`.
    pub async fn acquire_read(
        &self,
        key: &ResourceKey,
        timeout: Option<Duration>,
    ) -> Result<ReadHandle, LockError> {
        let lock = self.entry(key);
        let unavailable = || LockError::Unavailable {
            key: key.to_string(),
            mode: LockMode::Read,
        };

        let guard = match timeout {
            None => lock.read_owned().await,
            Some(t) if t.is_zero() => lock.try_read_owned().map_err(|_| unavailable())?,
            Some(t) => tokio::time::timeout(t, lock.read_owned())
                .await
                .map_err(|_| unavailable())?,
        };

        trace!(key = %key, "acquired read");
        Ok(ReadHandle {
            key: key.clone(),
            _guard: guard,
        })
    }

    /// Take an exclusive lock on `key`.
    pub async fn acquire_write(
        &self,
        key: &ResourceKey,
        timeout: Option<Duration>,
    ) -> Result<WriteHandle, LockError> {
        let lock = self.entry(key);
        let unavailable = || LockError::Unavailable {
            key: key.to_string(),
            mode: LockMode::Write,
        };

        let guard = match timeout {
            None => lock.write_owned().await,
            Some(t) if t.is_zero() => lock.try_write_owned().map_err(|_| unavailable())?,
            Some(t) => tokio::time::timeout(t, lock.write_owned())
                .await
                .map_err(|_| unavailable())?,
        };

        trace!(key = %key, "acquired write");
        Ok(WriteHandle {
            key: key.clone(),
            _guard: guard,
        })
    }

    /// Number of keys ever locked through this registry.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of live handles (held or waiting) on `key`.
    pub fn holders(&self, key: &ResourceKey) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .map(|lock| Arc::strong_count(lock) - 1)
            .unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
