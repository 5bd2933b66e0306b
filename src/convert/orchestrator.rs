//! Conversion orchestrator.
//!
//! Runs one request through its lifecycle:
//!
//! ```text
//! Pending ──guard──► Locked ──spawn──► Running ──exit 0──► Validated ──► Succeeded
//!    │                 │                  │                    │
//!    └── Busy ◄────────┘                  └──── Failed ◄───────┘
//! ```
//!
//! The file guard is held for the whole converter run and released on every
//! path out. A failed run never leaves its output behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::ConvertError;
use crate::lock::{BackoffPolicy, FileGuard, GuardOptions, LockRegistry};
use crate::series::{DicomProbe, SeriesAssembler, SeriesAssembly};

use super::backend::{ConverterBackend, ExitClass, ProcessOutput, EXIT_LIBRARY_ERROR};
use super::capabilities::Capabilities;
use super::command::{self, CommandPlan};
use super::meta::{add_channel_paths, parse_info, parse_meta, Metadata};
use super::request::{ConversionRequest, Operation, OutputPolicy};
use super::token::{ConversionToken, ImageDims};

/// Outputs smaller than this are treated as failed conversions.
pub const DEFAULT_MIN_OUTPUT_SIZE: u64 = 10;

/// Existing outputs larger than this are reused under [`OutputPolicy::SkipIfExists`].
pub const SKIP_EXISTING_MIN_SIZE: u64 = 16;

// =============================================================================
// Settings
// =============================================================================

/// Runtime policy of a [`Converter`].
#[derive(Debug, Clone)]
pub struct ConverterSettings {
    /// Minimum size in bytes of a valid output
    pub min_output_size: u64,

    /// Wait for busy inputs and outputs on regular reads
    pub block_reads: bool,

    /// Wait for busy inputs and outputs on tile and histogram reads
    pub block_tile_reads: bool,

    /// Retry schedule for shared advisory locks
    pub backoff: BackoffPolicy,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            min_output_size: DEFAULT_MIN_OUTPUT_SIZE,
            block_reads: true,
            block_tile_reads: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

// =============================================================================
// Request State and Output
// =============================================================================

/// Lifecycle stage of a request, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Locked,
    Running,
    Validated,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Pending => "pending",
            RequestState::Locked => "locked",
            RequestState::Running => "running",
            RequestState::Validated => "validated",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConversionOutput {
    /// Path of the written output
    File(PathBuf),

    /// Raw converter output of a command without an output file
    Text(String),

    Metadata(Metadata),
    Supported(bool),
}

// =============================================================================
// Converter
// =============================================================================

/// Runs converter requests under file guards.
pub struct Converter {
    backend: Arc<dyn ConverterBackend>,
    capabilities: Arc<Capabilities>,
    registry: Arc<LockRegistry>,
    settings: ConverterSettings,
    assembler: SeriesAssembler,
}

impl Converter {
    pub fn new(
        backend: Arc<dyn ConverterBackend>,
        capabilities: Arc<Capabilities>,
        registry: Arc<LockRegistry>,
        settings: ConverterSettings,
    ) -> Self {
        Self {
            backend,
            capabilities,
            registry,
            settings,
            assembler: SeriesAssembler::new(Arc::new(DicomProbe::new())),
        }
    }

    /// Replace the DICOM-based series assembler.
    pub fn with_assembler(mut self, assembler: SeriesAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn settings(&self) -> &ConverterSettings {
        &self.settings
    }

    /// Execute a request against a token.
    pub async fn execute(
        &self,
        token: &ConversionToken,
        request: &ConversionRequest,
    ) -> Result<ConversionOutput, ConvertError> {
        self.capabilities.require_installed()?;
        request.validate()?;

        match &request.operation {
            Operation::Meta => self.meta(token).await.map(ConversionOutput::Metadata),
            Operation::Info => self
                .info_metadata(token)
                .await
                .map(ConversionOutput::Metadata),
            Operation::Supported => self.supported(token).await.map(ConversionOutput::Supported),
            operation => {
                let plan = command::plan(request, token, &self.capabilities)?;
                let fail_on_read = request.fail_on_read || !self.blocks_on(operation);
                self.run(plan, request.policy, fail_on_read).await
            }
        }
    }

    fn blocks_on(&self, operation: &Operation) -> bool {
        match operation {
            Operation::Tile { .. } | Operation::Histogram => self.settings.block_tile_reads,
            _ => self.settings.block_reads,
        }
    }

    /// Run a prepared command with the input read-locked and the output
    /// write-locked.
    ///
    /// Transient library errors are retried once. The output size is checked
    /// while the write lock is still held, and on any failure the output and
    /// its file list are removed before the lock is released. With
    /// `fail_on_read`, a busy output after the run yields `Busy` instead of
    /// waiting for it.
    pub async fn run(
        &self,
        plan: CommandPlan,
        policy: OutputPolicy,
        fail_on_read: bool,
    ) -> Result<ConversionOutput, ConvertError> {
        self.capabilities.require_installed()?;
        let label = plan.args.join(" ");
        transition(&label, RequestState::Pending);

        let options = GuardOptions::default()
            .fail_on_output_exists(policy == OutputPolicy::FailIfExists)
            .with_backoff(self.settings.backoff);
        let mut guard = FileGuard::new(
            self.registry.clone(),
            Some(&plan.input),
            plan.output.as_ref(),
            options,
        );
        if let Err(e) = guard.acquire().await {
            transition(&label, RequestState::Failed);
            return Err(e.into());
        }
        transition(&label, RequestState::Locked);

        let result = match self.run_locked(&plan, policy, &label).await {
            Ok(stdout) => match &plan.output {
                Some(output) => self.check_output_size(output).await.map(|_| stdout),
                None => Ok(stdout),
            },
            Err(e) => Err(e),
        };

        if let Some(list) = &plan.file_list {
            remove_file(&list.path).await;
        }
        if result.is_err() {
            if let Some(output) = &plan.output {
                remove_file(output).await;
            }
        }
        guard.release();

        let stdout = match result {
            Ok(stdout) => stdout,
            Err(e) => {
                transition(&label, RequestState::Failed);
                return Err(e);
            }
        };

        let Some(output) = plan.output else {
            transition(&label, RequestState::Succeeded);
            return Ok(ConversionOutput::Text(stdout));
        };

        if let Err(e) = self.wait_for_readers(&output, fail_on_read).await {
            transition(&label, RequestState::Failed);
            return Err(e);
        }
        transition(&label, RequestState::Validated);
        transition(&label, RequestState::Succeeded);
        Ok(ConversionOutput::File(output))
    }

    async fn run_locked(
        &self,
        plan: &CommandPlan,
        policy: OutputPolicy,
        label: &str,
    ) -> Result<String, ConvertError> {
        if let Some(output) = &plan.output {
            let existing = tokio::fs::metadata(output)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if existing > SKIP_EXISTING_MIN_SIZE {
                if policy == OutputPolicy::SkipIfExists {
                    warn!(output = %output.display(), "Output exists, skipping conversion");
                    return Ok(String::new());
                }
                warn!(output = %output.display(), "Output exists, overwriting");
            }
        }

        if let Some(list) = &plan.file_list {
            tokio::fs::write(&list.path, list.contents())
                .await
                .map_err(|e| ConvertError::io(&list.path, e))?;
        }

        transition(label, RequestState::Running);
        info!(input = %plan.input.display(), args = %label, "Running converter");
        let out = self.invoke_with_retry(&plan.args).await;

        match out.class() {
            ExitClass::Success => Ok(out.stdout),
            ExitClass::Timeout => {
                info!(args = %label, "Converter timed out");
                Err(ConvertError::Timeout {
                    command: label.to_string(),
                })
            }
            ExitClass::Transient => Err(ConvertError::TransientLibrary { code: out.code }),
            ExitClass::Failed => {
                info!(code = out.code, args = %label, "Converter failed");
                Err(ConvertError::ConverterFailed {
                    code: out.code,
                    stderr: out.stderr,
                })
            }
        }
    }

    /// Wait until other users of the output are done with it.
    async fn wait_for_readers(&self, output: &Path, fail_on_read: bool) -> Result<(), ConvertError> {
        if !output.exists() {
            return Ok(());
        }
        let options = GuardOptions::default()
            .fail_on_input_busy(fail_on_read)
            .with_backoff(self.settings.backoff);
        let mut reader = FileGuard::reader(self.registry.clone(), output, options);
        reader.acquire().await?;
        reader.release();
        Ok(())
    }

    /// Check the output size. Must be called with the output write-locked;
    /// the caller removes a rejected output before releasing the lock.
    async fn check_output_size(&self, output: &Path) -> Result<(), ConvertError> {
        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                error!(output = %output.display(), "Converter reported success but wrote no output");
                return Err(ConvertError::CorruptOutput {
                    path: output.to_path_buf(),
                    size: 0,
                    minimum: self.settings.min_output_size,
                });
            }
        };

        if size < self.settings.min_output_size {
            error!(
                output = %output.display(),
                size,
                minimum = self.settings.min_output_size,
                "Output is too small, removing"
            );
            return Err(ConvertError::CorruptOutput {
                path: output.to_path_buf(),
                size,
                minimum: self.settings.min_output_size,
            });
        }
        Ok(())
    }

    /// Run a read-only query with the input read-locked.
    pub async fn run_read(
        &self,
        input: &Path,
        args: &[String],
        fail_on_read: bool,
    ) -> Result<String, ConvertError> {
        self.capabilities.require_installed()?;
        tokio::fs::metadata(input)
            .await
            .map_err(|e| ConvertError::io(input, e))?;

        let options = GuardOptions::default()
            .fail_on_input_busy(fail_on_read)
            .with_backoff(self.settings.backoff);
        let mut guard = FileGuard::reader(self.registry.clone(), input, options);
        guard.acquire().await?;

        debug!(input = %input.display(), ?args, "Running converter query");
        let out = self.invoke_with_retry(args).await;
        guard.release();

        match out.class() {
            ExitClass::Success => Ok(out.stdout),
            ExitClass::Timeout => Err(ConvertError::Timeout {
                command: args.join(" "),
            }),
            ExitClass::Transient => Err(ConvertError::TransientLibrary { code: out.code }),
            ExitClass::Failed => Err(ConvertError::ConverterFailed {
                code: out.code,
                stderr: out.stderr,
            }),
        }
    }

    async fn invoke(&self, args: &[String]) -> ProcessOutput {
        match self.backend.invoke(args).await {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "Converter could not be started");
                ProcessOutput {
                    code: EXIT_LIBRARY_ERROR,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        }
    }

    async fn invoke_with_retry(&self, args: &[String]) -> ProcessOutput {
        let out = self.invoke(args).await;
        if out.class() != ExitClass::Transient {
            return out;
        }
        warn!(code = out.code, "Transient converter error, retrying once");
        self.invoke(args).await
    }

    // -------------------------------------------------------------------------
    // Read-only queries
    // -------------------------------------------------------------------------

    /// Full metadata of the token's first file, with multi-file series
    /// geometry applied on top.
    pub async fn meta(&self, token: &ConversionToken) -> Result<Metadata, ConvertError> {
        let listing = self.query(token, Operation::Meta).await?;
        let mut meta = parse_meta(&listing);

        if let Some(series) = token.series_meta() {
            meta.extend(series.to_metadata());
            if series.channels > 1 {
                meta.remove("channel_color_0");
                meta.remove("channel_0_name");
            }
        }
        add_channel_paths(&mut meta);
        Ok(meta)
    }

    /// Core dimensions of the token's image.
    pub async fn info(&self, token: &ConversionToken) -> Result<ImageDims, ConvertError> {
        let meta = self.info_metadata(token).await?;
        Ok(ImageDims::from_meta(&meta))
    }

    async fn info_metadata(&self, token: &ConversionToken) -> Result<Metadata, ConvertError> {
        let listing = self.query(token, Operation::Info).await?;
        let mut meta = parse_info(&listing);
        if let Some(series) = token.series_meta() {
            meta.extend(series.to_metadata());
        }
        Ok(meta)
    }

    /// Whether the converter can read the token's first file.
    pub async fn supported(&self, token: &ConversionToken) -> Result<bool, ConvertError> {
        let out = self.query(token, Operation::Supported).await?;
        Ok(out.starts_with("yes"))
    }

    async fn query(
        &self,
        token: &ConversionToken,
        operation: Operation,
    ) -> Result<String, ConvertError> {
        let plan = command::plan(
            &ConversionRequest::new(operation),
            token,
            &self.capabilities,
        )?;
        self.run_read(&plan.input, &plan.args, !self.settings.block_reads)
            .await
    }

    /// Group an unordered file set into ordered series.
    ///
    /// Probing reads file headers and runs on the blocking thread pool.
    pub async fn group_files(&self, files: Vec<PathBuf>) -> Result<SeriesAssembly, ConvertError> {
        let assembler = self.assembler.clone();
        tokio::task::spawn_blocking(move || assembler.assemble(&files))
            .await
            .map_err(|e| ConvertError::Worker(e.to_string()))
    }
}

fn transition(label: &str, state: RequestState) {
    debug!(command = label, %state, "Request state");
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove file"),
    }
}
