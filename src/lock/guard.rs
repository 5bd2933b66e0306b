//! Scoped file guard.
//!
//! A [`FileGuard`] protects one conversion: it read-locks the input and
//! write-locks the output, first in the process-wide [`LockRegistry`] and then,
//! on POSIX systems, with advisory `flock` locks so that other processes on
//! the same host are excluded as well.
//!
//! Acquisition order:
//! 1. registry read lock on the input
//! 2. shared advisory lock on the input, retried with exponential backoff
//! 3. registry write lock on the output
//! 4. exclusive advisory lock on the output, single non-blocking attempt
//!
//! Release runs in reverse order, is idempotent, and happens automatically when
//! the guard is dropped. Releasing a claimed output that is still empty deletes
//! it, cleaning up after aborted writes.
//!
//! Windows builds skip the advisory locks and rely on the registry alone.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
#[cfg(unix)]
use std::time::Instant;

#[cfg(unix)]
use fs2::FileExt;
use tracing::{debug, info};

use crate::error::GuardError;

use super::backoff::BackoffPolicy;
use super::registry::{LockRegistry, ReadHandle, ResourceKey, WriteHandle};

// =============================================================================
// Options
// =============================================================================

/// Policies applied while acquiring a [`FileGuard`].
#[derive(Debug, Clone, Default)]
pub struct GuardOptions {
    /// Give up if the output path already exists
    pub fail_on_output_exists: bool,

    /// Give up instead of waiting when the input is held by a writer
    pub fail_on_input_busy: bool,

    /// Retry schedule for the shared advisory lock on the input
    pub backoff: BackoffPolicy,
}

impl GuardOptions {
    pub fn fail_on_output_exists(mut self, value: bool) -> Self {
        self.fail_on_output_exists = value;
        self
    }

    pub fn fail_on_input_busy(mut self, value: bool) -> Self {
        self.fail_on_input_busy = value;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

// =============================================================================
// File Guard
// =============================================================================

/// Scoped read/write lock over an input file and an output file.
#[derive(Debug)]
pub struct FileGuard {
    registry: Arc<LockRegistry>,
    input: Option<ResourceKey>,
    output: Option<ResourceKey>,
    options: GuardOptions,

    read: Option<ReadHandle>,
    write: Option<WriteHandle>,
    read_file: Option<File>,
    write_file: Option<File>,

    /// Set once the output passed the existence check and belongs to this guard
    output_claimed: bool,
    locked: bool,
}

impl FileGuard {
    /// Create a guard. Nothing is locked until [`FileGuard::acquire`].
    pub fn new(
        registry: Arc<LockRegistry>,
        input: Option<impl AsRef<Path>>,
        output: Option<impl AsRef<Path>>,
        options: GuardOptions,
    ) -> Self {
        Self {
            registry,
            input: input.map(ResourceKey::new),
            output: output.map(ResourceKey::new),
            options,
            read: None,
            write: None,
            read_file: None,
            write_file: None,
            output_claimed: false,
            locked: false,
        }
    }

    /// Guard that only read-locks `input`.
    pub fn reader(
        registry: Arc<LockRegistry>,
        input: impl AsRef<Path>,
        options: GuardOptions,
    ) -> Self {
        Self::new(registry, Some(input), None::<&Path>, options)
    }

    /// Whether every requested lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn input(&self) -> Option<&ResourceKey> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&ResourceKey> {
        self.output.as_ref()
    }

    /// Acquire all locks.
    ///
    /// On failure, anything already taken is released before returning, so a
    /// failed guard holds nothing. Calling this on a locked guard is a no-op.
    pub async fn acquire(&mut self) -> Result<(), GuardError> {
        if self.locked {
            return Ok(());
        }

        match self.acquire_all().await {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(e) => {
                debug!(input = ?self.input, output = ?self.output, error = %e, "guard acquisition abandoned");
                self.release();
                Err(e)
            }
        }
    }

    async fn acquire_all(&mut self) -> Result<(), GuardError> {
        if let Some(input) = self.input.clone() {
            let timeout = self.options.fail_on_input_busy.then_some(Duration::ZERO);
            let handle = self
                .registry
                .acquire_read(&input, timeout)
                .await
                .map_err(|_| GuardError::InputBusy(input.path().to_path_buf()))?;
            self.read = Some(handle);
            debug!(key = %input, "input read lock held");

            #[cfg(unix)]
            {
                self.read_file = Some(self.lock_input_shared(input.path()).await?);
            }
        }

        if let Some(output) = self.output.clone() {
            let timeout = self.options.fail_on_output_exists.then_some(Duration::ZERO);
            let handle = self
                .registry
                .acquire_write(&output, timeout)
                .await
                .map_err(|_| GuardError::OutputBusy(output.path().to_path_buf()))?;
            self.write = Some(handle);
            debug!(key = %output, "output write lock held");

            if self.options.fail_on_output_exists && output.path().exists() {
                return Err(GuardError::OutputExists(output.path().to_path_buf()));
            }
            self.output_claimed = true;

            #[cfg(unix)]
            {
                self.write_file = Some(lock_output_exclusive(output.path())?);
            }
        }

        Ok(())
    }

    #[cfg(unix)]
    async fn lock_input_shared(&self, path: &Path) -> Result<File, GuardError> {
        let started = Instant::now();
        let mut delays = self.options.backoff.delays();

        loop {
            let file = File::open(path).map_err(|e| GuardError::io(path, e))?;
            if FileExt::try_lock_shared(&file).is_ok() {
                return Ok(file);
            }
            drop(file);

            if self.options.fail_on_input_busy {
                return Err(GuardError::InputBusy(path.to_path_buf()));
            }

            match delays.next() {
                Some(delay) => {
                    debug!(path = %path.display(), ?delay, "shared lock busy, backing off");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(GuardError::BackoffExhausted {
                        path: path.to_path_buf(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Release every held lock in reverse acquisition order.
    ///
    /// Safe to call any number of times.
    pub fn release(&mut self) {
        if let Some(file) = self.write_file.take() {
            #[cfg(unix)]
            {
                let _ = FileExt::unlock(&file);
            }
            drop(file);
        }

        if self.output_claimed {
            if let Some(output) = &self.output {
                remove_if_empty(output.path());
            }
            self.output_claimed = false;
        }

        if let Some(handle) = self.write.take() {
            handle.release();
        }

        if let Some(file) = self.read_file.take() {
            #[cfg(unix)]
            {
                let _ = FileExt::unlock(&file);
            }
            drop(file);
        }

        if let Some(handle) = self.read.take() {
            handle.release();
        }

        self.locked = false;
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn lock_output_exclusive(path: &Path) -> Result<File, GuardError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| GuardError::OutputLockFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    FileExt::try_lock_exclusive(&file).map_err(|e| GuardError::OutputLockFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(file)
}

fn remove_if_empty(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() && meta.len() == 0 {
            info!(path = %path.display(), "removing zero-size output");
            let _ = std::fs::remove_file(path);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
