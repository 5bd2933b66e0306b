//! File locking layer.
//!
//! This module serializes access to image files and converter outputs across
//! threads of this process and, on POSIX systems, across processes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Conversion Orchestrator         │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │               FileGuard                 │
//! │  (input read + output write, scoped)    │
//! └──────────┬──────────────────┬───────────┘
//!            │                  │
//!            ▼                  ▼
//! ┌────────────────────┐ ┌──────────────────┐
//! │   LockRegistry     │ │ advisory flock   │
//! │ (in-process RW per │ │ (POSIX only,     │
//! │  absolute path)    │ │  cross-process)  │
//! └────────────────────┘ └──────────────────┘
//! ```
//!
//! # Components
//!
//! - [`LockRegistry`]: lazily created reader/writer lock per [`ResourceKey`]
//! - [`FileGuard`]: composes registry locks with advisory file locks and
//!   releases everything on drop
//! - [`BackoffPolicy`]: retry schedule for the shared advisory lock
//!
//! # Example
//!
//! ```no_run
//! use bioimage_engine::lock::{FileGuard, GuardOptions, LockRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = LockRegistry::global();
//!     let mut guard = FileGuard::new(
//!         registry,
//!         Some("data/stack.tif"),
//!         Some("cache/stack.jpg"),
//!         GuardOptions::default(),
//!     );
//!     if guard.acquire().await.is_ok() {
//!         // write cache/stack.jpg
//!     }
//!     // released when `guard` goes out of scope
//! }
//! ```

mod backoff;
mod guard;
mod registry;

pub use backoff::{
    Backoff, BackoffPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_WAIT,
};
pub use guard::{FileGuard, GuardOptions};
pub use registry::{LockMode, LockRegistry, ReadHandle, ResourceKey, WriteHandle};
