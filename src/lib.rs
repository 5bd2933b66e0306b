//! # Bioimage Engine
//!
//! Image conversion and concurrency engine for bio-image services.
//!
//! This library runs an external image converter on behalf of concurrent
//! callers. It serializes access to inputs and outputs, turns high-level
//! requests into converter command lines, validates what the converter
//! produced, and groups loose per-plane files into ordered series.
//!
//! ## Features
//!
//! - **File locking**: per-path reader/writer locks plus POSIX advisory locks
//! - **Conversion orchestration**: lock, run, retry transient failures, validate
//! - **Series assembly**: DICOM-aware grouping and ordering of multi-file stacks
//! - **Addressing**: page numbers, pyramid level selection and ROI conversion
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`lock`] - Lock registry and scoped file guards
//! - [`convert`] - Requests, command construction and the orchestrator
//! - [`series`] - Multi-file series grouping
//! - [`addressing`] - Page, pyramid and ROI arithmetic
//! - [`config`] - CLI and configuration types
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bioimage_engine::{
//!     Capabilities, ConversionRequest, ConversionToken, Converter, ConverterSettings,
//!     LockRegistry, Operation, ProcessBackend,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(ProcessBackend::new("imgcnv"));
//!     let capabilities = Capabilities::probe(backend.as_ref(), "imgcnv").await;
//!     let converter = Converter::new(
//!         backend,
//!         Arc::new(capabilities),
//!         LockRegistry::global(),
//!         ConverterSettings::default(),
//!     );
//!
//!     let token = ConversionToken::single("data/stack.tif");
//!     let params = vec![("resize".to_string(), "256,256".to_string())];
//!     let request = ConversionRequest::new(Operation::parse("thumbnail", &params).unwrap())
//!         .with_output("cache/stack.jpg");
//!
//!     let _ = converter.execute(&token, &request).await;
//! }
//! ```

pub mod addressing;
pub mod config;
pub mod convert;
pub mod error;
pub mod lock;
pub mod series;

// Re-export commonly used types
pub use addressing::{
    middle_plane, page_number, pages_for_ranges, DimensionOrder, PlaneCounts, PlaneRange,
    ResolutionLevels, Roi,
};
pub use config::{CheckConfig, Cli, Command, ConvertConfig, EngineConfig, GroupConfig, PageConfig};
pub use convert::{
    Capabilities, CommandPlan, ConversionOutput, ConversionRequest, ConversionToken, Converter,
    ConverterBackend, ConverterSettings, ConverterVersion, ExitClass, ImageDims, Metadata,
    MetaValue, Operation, OutputPolicy, ProcessBackend, ProcessOutput, RequestState, SeriesMeta,
};
pub use error::{ConvertError, GuardError, LockError, RETRY_AFTER_SECS};
pub use lock::{BackoffPolicy, FileGuard, GuardOptions, LockMode, LockRegistry, ResourceKey};
pub use series::{
    DicomProbe, FrameHint, Geometry, GroupKey, ProbedSlice, SeriesAssembler, SeriesAssembly,
    SeriesGroup, SeriesProbe,
};
