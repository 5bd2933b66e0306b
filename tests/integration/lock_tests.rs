//! Lock registry and file guard tests across concurrent tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bioimage_engine::error::GuardError;
use bioimage_engine::lock::{BackoffPolicy, FileGuard, GuardOptions, LockRegistry, ResourceKey};

use super::test_utils::write_file;

fn short_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        max_wait: Some(Duration::from_millis(50)),
    }
}

// =============================================================================
// Registry
// =============================================================================

#[tokio::test]
async fn test_writers_on_same_key_never_overlap() {
    let registry = Arc::new(LockRegistry::new());
    let key = ResourceKey::new("/data/shared.tif");
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let key = key.clone();
        let active = active.clone();
        let max_active = max_active.clone();
        tasks.push(tokio::spawn(async move {
            let handle = registry.acquire_write(&key, None).await.unwrap();
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            handle.release();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(registry.holders(&key), 0);
}

#[tokio::test]
async fn test_readers_share_a_key() {
    let registry = Arc::new(LockRegistry::new());
    let key = ResourceKey::new("/data/shared.tif");

    let first = registry.acquire_read(&key, None).await.unwrap();
    let second = registry
        .acquire_read(&key, Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(registry.holders(&key), 2);

    assert!(registry
        .acquire_write(&key, Some(Duration::from_millis(20)))
        .await
        .is_err());

    first.release();
    second.release();
    assert!(registry
        .acquire_write(&key, Some(Duration::ZERO))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_distinct_keys_are_independent() {
    let registry = Arc::new(LockRegistry::new());
    let a = registry
        .acquire_write(&ResourceKey::new("/data/a.tif"), None)
        .await
        .unwrap();
    let b = registry
        .acquire_write(&ResourceKey::new("/data/b.tif"), Some(Duration::ZERO))
        .await;
    assert!(b.is_ok());
    assert_eq!(registry.entry_count(), 2);
    a.release();
}

// =============================================================================
// Guards
// =============================================================================

#[tokio::test]
async fn test_second_writer_is_busy_until_first_releases() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 64);
    let output = dir.path().join("out.jpg");
    let registry = Arc::new(LockRegistry::new());

    let mut first = FileGuard::new(
        registry.clone(),
        Some(&input),
        Some(&output),
        GuardOptions::default(),
    );
    first.acquire().await.unwrap();

    let mut second = FileGuard::new(
        registry.clone(),
        Some(&input),
        Some(&output),
        GuardOptions::default()
            .fail_on_output_exists(true)
            .with_backoff(short_backoff()),
    );
    let err = second.acquire().await.unwrap_err();
    assert!(matches!(err, GuardError::OutputBusy(_)));
    assert!(!second.is_locked());

    // Nothing was written, so the claimed output is removed on release
    first.release();
    assert!(!output.exists());

    second.acquire().await.unwrap();
    assert!(second.is_locked());
}

#[tokio::test]
async fn test_dropped_guard_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 64);
    let output = dir.path().join("out.tif");
    let registry = Arc::new(LockRegistry::new());

    {
        let mut guard = FileGuard::new(
            registry.clone(),
            Some(&input),
            Some(&output),
            GuardOptions::default(),
        );
        guard.acquire().await.unwrap();
        assert_eq!(registry.holders(&ResourceKey::new(&input)), 1);
        assert_eq!(registry.holders(&ResourceKey::new(&output)), 1);
    }

    assert_eq!(registry.holders(&ResourceKey::new(&input)), 0);
    assert_eq!(registry.holders(&ResourceKey::new(&output)), 0);
}

#[tokio::test]
async fn test_reader_waits_for_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "shared.tif", 64);
    let registry = Arc::new(LockRegistry::new());

    let writer = registry
        .acquire_write(&ResourceKey::new(&path), None)
        .await
        .unwrap();

    let reader_registry = registry.clone();
    let reader_path = path.clone();
    let reader = tokio::spawn(async move {
        let mut guard = FileGuard::reader(reader_registry, &reader_path, GuardOptions::default());
        guard.acquire().await.map(|_| guard.is_locked())
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!reader.is_finished());

    writer.release();
    assert!(reader.await.unwrap().unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_shared_lock_backoff_is_bounded() {
    use fs2::FileExt;

    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 64);

    // Another process-level holder of an exclusive advisory lock
    let holder = std::fs::File::open(&input).unwrap();
    FileExt::lock_exclusive(&holder).unwrap();

    let mut guard = FileGuard::reader(
        Arc::new(LockRegistry::new()),
        &input,
        GuardOptions::default().with_backoff(short_backoff()),
    );
    let err = guard.acquire().await.unwrap_err();
    assert!(matches!(err, GuardError::BackoffExhausted { .. }));

    let mut fail_fast = FileGuard::reader(
        Arc::new(LockRegistry::new()),
        &input,
        GuardOptions::default().fail_on_input_busy(true),
    );
    let err = fail_fast.acquire().await.unwrap_err();
    assert!(matches!(err, GuardError::InputBusy(_)));

    FileExt::unlock(&holder).unwrap();
    assert!(guard.acquire().await.is_ok());
}
