//! Conversion orchestration.
//!
//! Turns a [`ConversionRequest`] against a [`ConversionToken`] into one run of
//! the external converter, guarded by the file locking layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Converter                       │
//! │  (lifecycle, retry, cleanup, output validation)      │
//! └───────┬───────────────┬───────────────┬──────────────┘
//!         │               │               │
//!         ▼               ▼               ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────────┐
//! │ command::plan│ │  FileGuard   │ │ ConverterBackend │
//! │ (argv build) │ │ (lock layer) │ │ (child process)  │
//! └──────┬───────┘ └──────────────┘ └──────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │ Capabilities, addressing     │
//! │ (formats, pages, levels, ROI)│
//! └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bioimage_engine::convert::{
//!     Capabilities, ConversionRequest, ConversionToken, Converter, ConverterSettings,
//!     Operation, ProcessBackend,
//! };
//! use bioimage_engine::lock::LockRegistry;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(ProcessBackend::new("imgcnv"));
//!     let capabilities = Arc::new(Capabilities::probe(backend.as_ref(), "imgcnv").await);
//!     let converter = Converter::new(
//!         backend,
//!         capabilities,
//!         LockRegistry::global(),
//!         ConverterSettings::default(),
//!     );
//!
//!     let token = ConversionToken::single("data/stack.tif");
//!     let operation = Operation::parse("thumbnail", &[]).expect("default thumbnail");
//!     let request = ConversionRequest::new(operation).with_output("cache/stack.jpg");
//!     match converter.execute(&token, &request).await {
//!         Ok(output) => println!("{:?}", output),
//!         Err(e) if e.is_retry_later() => println!("busy, retry later"),
//!         Err(e) => eprintln!("{}", e),
//!     }
//! }
//! ```

mod backend;
mod capabilities;
pub mod command;
mod meta;
mod orchestrator;
mod request;
mod token;

pub use backend::{
    ConverterBackend, ExitClass, ProcessBackend, ProcessOutput, EXIT_LIBRARY_BUSY,
    EXIT_LIBRARY_ERROR, EXIT_TIMEOUT,
};
pub use capabilities::{
    parse_formats_xml, Capabilities, ConverterVersion, FormatInfo, REQUIRED_VERSION,
};
pub use command::{plan, CommandPlan, FileList};
pub use meta::{add_channel_paths, parse_info, parse_meta, MetaValue, Metadata, INFO_KEYS};
pub use orchestrator::{
    ConversionOutput, Converter, ConverterSettings, RequestState, DEFAULT_MIN_OUTPUT_SIZE,
    SKIP_EXISTING_MIN_SIZE,
};
pub use request::{ConversionRequest, Operation, OutputPolicy, EXTENDED_DIMENSIONS};
pub use token::{ConversionToken, ImageDims, SeriesMeta};
