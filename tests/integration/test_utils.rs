//! Test utilities for integration tests.
//!
//! This module provides a scripted converter backend, an in-memory series
//! probe and helpers for building engines over temporary directories.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bioimage_engine::convert::{
    Capabilities, ConverterBackend, ConverterSettings, ConverterVersion, Converter, ProcessOutput,
};
use bioimage_engine::lock::{BackoffPolicy, LockRegistry};
use bioimage_engine::series::{ProbedSlice, SeriesProbe};

// =============================================================================
// Mock Converter Backend
// =============================================================================

/// A converter that replays scripted exit codes.
///
/// Each invocation pops the next exit code (falling back to the default once
/// the script runs out) and writes `payload` bytes to the path following
/// `-o` or `-ohst`, whatever the exit code. Concurrent invocations are
/// detected and recorded.
pub struct MockBackend {
    script: Mutex<VecDeque<i32>>,
    default_code: i32,
    payload: usize,
    stdout: String,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    overlapped: AtomicBool,
    invocations: Mutex<Vec<Vec<String>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_code: 0,
            payload: 1024,
            stdout: String::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_codes(self, codes: &[i32]) -> Self {
        *self.script.lock().unwrap() = codes.iter().copied().collect();
        self
    }

    pub fn with_default_code(mut self, code: i32) -> Self {
        self.default_code = code;
        self
    }

    pub fn with_payload(mut self, bytes: usize) -> Self {
        self.payload = bytes;
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether two invocations ever ran at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.lock().unwrap().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConverterBackend for MockBackend {
    async fn invoke(&self, args: &[String]) -> io::Result<ProcessOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().unwrap().push(args.to_vec());

        if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let code = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_code);

        if let Some(output) = output_arg(args) {
            tokio::fs::write(&output, vec![b'x'; self.payload]).await?;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ProcessOutput {
            code,
            stdout: self.stdout.clone(),
            stderr: String::new(),
        })
    }
}

fn output_arg(args: &[String]) -> Option<PathBuf> {
    args.windows(2)
        .find(|pair| pair[0] == "-o" || pair[0] == "-ohst")
        .map(|pair| PathBuf::from(&pair[1]))
}

// =============================================================================
// Mock Series Probe
// =============================================================================

/// Probe answering from a fixed table; unknown paths are blobs.
pub struct MapProbe(pub HashMap<PathBuf, ProbedSlice>);

impl SeriesProbe for MapProbe {
    fn probe(&self, path: &Path) -> Option<ProbedSlice> {
        self.0.get(path).cloned()
    }
}

// =============================================================================
// Engine Helpers
// =============================================================================

pub fn installed_capabilities() -> Capabilities {
    Capabilities::installed("imgcnv", ConverterVersion::new(2, 4, 3), BTreeMap::new())
}

/// Settings with short lock backoff so busy paths resolve quickly.
pub fn fast_settings() -> ConverterSettings {
    ConverterSettings {
        backoff: BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_wait: Some(Duration::from_millis(200)),
        },
        ..ConverterSettings::default()
    }
}

pub fn converter_with(backend: Arc<MockBackend>, settings: ConverterSettings) -> Converter {
    Converter::new(
        backend,
        Arc::new(installed_capabilities()),
        Arc::new(LockRegistry::new()),
        settings,
    )
}

pub fn converter(backend: Arc<MockBackend>) -> Converter {
    converter_with(backend, fast_settings())
}

/// Create a file with `size` bytes of content and return its path.
pub fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![b'i'; size]).unwrap();
    path
}
