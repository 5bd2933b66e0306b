//! Converter invocation backends.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code reported when the converter hits its internal time budget.
pub const EXIT_TIMEOUT: i32 = 99;

/// Exit code for a transient library error. Also used when the converter
/// could not be started at all.
pub const EXIT_LIBRARY_ERROR: i32 = 100;

/// Exit code for a busy library.
pub const EXIT_LIBRARY_BUSY: i32 = 101;

/// Exit status and captured output of one converter run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// How the orchestrator should treat an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Worth one retry with the same command
    Transient,
    Timeout,
    Failed,
}

impl ProcessOutput {
    pub fn new(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn class(&self) -> ExitClass {
        match self.code {
            0 => ExitClass::Success,
            EXIT_LIBRARY_ERROR | EXIT_LIBRARY_BUSY => ExitClass::Transient,
            EXIT_TIMEOUT => ExitClass::Timeout,
            _ => ExitClass::Failed,
        }
    }
}

/// Runs the external converter with a prepared argument list.
///
/// Implementations must not retry or classify exit codes themselves; that
/// belongs to the orchestrator.
#[async_trait]
pub trait ConverterBackend: Send + Sync {
    /// Run the converter. `args` excludes the program name.
    async fn invoke(&self, args: &[String]) -> io::Result<ProcessOutput>;
}

/// Backend that spawns the converter executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
}

impl ProcessBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

#[async_trait]
impl ConverterBackend for ProcessBackend {
    async fn invoke(&self, args: &[String]) -> io::Result<ProcessOutput> {
        debug!(program = %self.program.display(), ?args, "Spawning converter");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            warn!(stderr = %stderr, "Converter wrote to stderr");
        }

        Ok(ProcessOutput {
            // Killed by a signal
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr,
        })
    }
}
