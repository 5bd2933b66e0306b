//! Multi-file series assembly.
//!
//! Volumetric and time-lapse acquisitions often arrive as one file per plane
//! with no meaningful ordering in their names. This module groups such files
//! into ordered stacks:
//!
//! ```text
//! files ──► SeriesProbe ──► (group key, ordering key, frame hint) ──► SeriesAssembler
//!                │                                                     │
//!                └── unreadable / no pixel data ──► blobs              ▼
//!                                                     groups + geometry (Z, T)
//! ```
//!
//! Metadata extraction is pluggable through [`SeriesProbe`]; [`DicomProbe`]
//! is the production implementation.

mod assembler;
mod dicom;

pub use assembler::{
    FrameHint, Geometry, GroupKey, ProbedSlice, SeriesAssembler, SeriesAssembly, SeriesGroup,
    SeriesMember, SeriesProbe,
};
pub use dicom::DicomProbe;
