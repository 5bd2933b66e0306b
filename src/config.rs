//! Configuration management for the bioimage engine.
//!
//! This module provides the command-line surface and engine settings:
//! - Subcommands via clap (`convert`, `group`, `page`, `check`)
//! - Environment variables with `BIOIMAGE_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use bioimage_engine::config::{Cli, Command};
//!
//! let cli = Cli::parse();
//! if let Command::Check(config) = cli.into_command() {
//!     println!("converter: {}", config.engine.converter);
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `BIOIMAGE_CONVERTER` - Converter executable (default: imgcnv)
//! - `BIOIMAGE_MIN_OUTPUT_SIZE` - Smallest valid output in bytes (default: 10)
//! - `BIOIMAGE_BLOCK_READS` - Wait for busy files on reads (default: true)
//! - `BIOIMAGE_BLOCK_TILE_READS` - Wait for busy files on tile reads (default: false)
//! - `BIOIMAGE_LOCK_INITIAL_MS` - First shared-lock retry delay (default: 300)
//! - `BIOIMAGE_LOCK_MAX_MS` - Longest shared-lock retry delay (default: 8000)
//! - `BIOIMAGE_LOCK_MAX_WAIT_SECS` - Total shared-lock wait, 0 for unbounded (default: 120)

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::convert::{ConverterSettings, DEFAULT_MIN_OUTPUT_SIZE};
use crate::lock::BackoffPolicy;

// =============================================================================
// Default Values
// =============================================================================

/// Default converter executable.
pub const DEFAULT_CONVERTER: &str = "imgcnv";

/// Default first retry delay for shared locks, in milliseconds.
pub const DEFAULT_LOCK_INITIAL_MS: u64 = 300;

/// Default longest retry delay for shared locks, in milliseconds.
pub const DEFAULT_LOCK_MAX_MS: u64 = 8000;

/// Default total wait for a shared lock, in seconds.
pub const DEFAULT_LOCK_MAX_WAIT_SECS: u64 = 120;

// =============================================================================
// CLI
// =============================================================================

/// Bioimage Engine - converter orchestration for bio-image files.
#[derive(Parser, Debug, Clone)]
#[command(name = "bioimage-engine")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one conversion or metadata request and print the result as JSON.
    Convert(ConvertConfig),

    /// Group files into ordered series and print the assembly as JSON.
    Group(GroupConfig),

    /// Print the page numbers of a Z/T selection.
    Page(PageConfig),

    /// Probe the converter and print its version and formats.
    Check(CheckConfig),
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct EngineConfig {
    /// Converter executable.
    #[arg(long, default_value = DEFAULT_CONVERTER, env = "BIOIMAGE_CONVERTER")]
    pub converter: String,

    /// Outputs smaller than this many bytes are treated as failures.
    #[arg(long, default_value_t = DEFAULT_MIN_OUTPUT_SIZE, env = "BIOIMAGE_MIN_OUTPUT_SIZE")]
    pub min_output_size: u64,

    /// Wait for busy inputs and outputs instead of failing.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "BIOIMAGE_BLOCK_READS")]
    pub block_reads: bool,

    /// Wait for busy inputs and outputs on tile and histogram reads.
    #[arg(long, default_value_t = false, action = ArgAction::Set, env = "BIOIMAGE_BLOCK_TILE_READS")]
    pub block_tile_reads: bool,

    /// First retry delay for shared file locks, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_LOCK_INITIAL_MS, env = "BIOIMAGE_LOCK_INITIAL_MS")]
    pub lock_initial_ms: u64,

    /// Longest retry delay for shared file locks, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_LOCK_MAX_MS, env = "BIOIMAGE_LOCK_MAX_MS")]
    pub lock_max_ms: u64,

    /// Total wait for a shared file lock in seconds, 0 waits forever.
    #[arg(long, default_value_t = DEFAULT_LOCK_MAX_WAIT_SECS, env = "BIOIMAGE_LOCK_MAX_WAIT_SECS")]
    pub lock_max_wait_secs: u64,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            converter: DEFAULT_CONVERTER.to_string(),
            min_output_size: DEFAULT_MIN_OUTPUT_SIZE,
            block_reads: true,
            block_tile_reads: false,
            lock_initial_ms: DEFAULT_LOCK_INITIAL_MS,
            lock_max_ms: DEFAULT_LOCK_MAX_MS,
            lock_max_wait_secs: DEFAULT_LOCK_MAX_WAIT_SECS,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.converter.trim().is_empty() {
            return Err(
                "Converter executable is required. Set --converter or BIOIMAGE_CONVERTER"
                    .to_string(),
            );
        }

        if self.lock_initial_ms == 0 {
            return Err("lock_initial_ms must be greater than 0".to_string());
        }
        if self.lock_max_ms < self.lock_initial_ms {
            return Err("lock_max_ms must not be smaller than lock_initial_ms".to_string());
        }

        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.lock_initial_ms),
            max_delay: Duration::from_millis(self.lock_max_ms),
            max_wait: match self.lock_max_wait_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn to_settings(&self) -> ConverterSettings {
        ConverterSettings {
            min_output_size: self.min_output_size,
            block_reads: self.block_reads,
            block_tile_reads: self.block_tile_reads,
            backoff: self.backoff(),
        }
    }
}

// =============================================================================
// Subcommand Configuration
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ConvertConfig {
    /// Operation: thumbnail, slice, tile, convert, histogram, meta, info or supported.
    pub operation: String,

    /// Input file. Repeat for a multi-file series, in plane order.
    #[arg(short, long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Output file for operations that write one.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Operation parameter as key=value (e.g. resize=256,256 or policy=skip).
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Sub-image selector within a multi-series file.
    #[arg(long)]
    pub series: Option<String>,

    /// Group multiple inputs as a DICOM series before converting.
    #[arg(long, default_value_t = false)]
    pub group: bool,

    #[command(flatten)]
    pub engine: EngineConfig,
}

#[derive(Args, Debug, Clone)]
pub struct GroupConfig {
    /// Files to group.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub engine: EngineConfig,
}

#[derive(Args, Debug, Clone)]
pub struct PageConfig {
    /// Number of Z planes.
    #[arg(long, default_value_t = 1)]
    pub z_count: u32,

    /// Number of time points.
    #[arg(long, default_value_t = 1)]
    pub t_count: u32,

    /// Dimension order of the pages.
    #[arg(long, default_value = "XYCZT")]
    pub order: String,

    /// Z plane or range, 1-based (`3` or `3-7`).
    #[arg(long, default_value = "1")]
    pub z: String,

    /// Time point or range, 1-based.
    #[arg(long, default_value = "1")]
    pub t: String,
}

#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub engine: EngineConfig,
}

/// Parse a `key=value` parameter. The value is percent-decoded.
fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }
    let value = urlencoding::decode(value)
        .map_err(|e| format!("invalid encoding in '{}': {}", s, e))?;
    Ok((key.to_string(), value.into_owned()))
}

// =============================================================================
// Tests
// =============================================================================
