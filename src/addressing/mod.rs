//! Page and tile addressing.
//!
//! Converts logical plane requests into what the converter understands:
//!
//! - [`page`]: (Z, T) pairs to 1-based linear page numbers, honoring the
//!   declared dimension order, plus per-channel file expansion for
//!   multi-file series
//! - [`pyramid`]: best-fit resolution level for a requested output size
//! - [`roi`]: 1-based region-of-interest to converter coordinates

pub mod page;
pub mod pyramid;
pub mod roi;

pub use page::{
    expand_channels, middle_plane, page_number, pages_for_ranges, DimensionOrder, PlaneCounts,
    PlaneRange,
};
pub use pyramid::ResolutionLevels;
pub use roi::Roi;
