//! Linear page addressing for multi-plane images.
//!
//! Single-file multi-plane formats store planes as a flat sequence of pages.
//! Which plane a page holds depends on the dimension order: in `XYCZT`, Z
//! iterates faster than T; in `XYCTZ`, T iterates faster than Z. Pages and
//! plane indices are 1-based.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// Largest time index used when picking a middle frame for previews.
const MIDDLE_PLANE_T_LIMIT: u32 = 500;

// =============================================================================
// Dimension Order
// =============================================================================

/// Storage order of the X, Y, C, Z and T dimensions, fastest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DimensionOrder(String);

impl DimensionOrder {
    /// `XYCZT`, the converter's default.
    pub fn xyczt() -> Self {
        Self("XYCZT".to_string())
    }

    /// Whether Z planes of one time point are stored contiguously.
    ///
    /// Only orders starting with `XYCT` keep T inside Z.
    pub fn z_iterates_faster(&self) -> bool {
        !self.0.starts_with("XYCT")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DimensionOrder {
    fn default() -> Self {
        Self::xyczt()
    }
}

impl fmt::Display for DimensionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DimensionOrder {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let order: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let mut letters: Vec<char> = order.chars().collect();
        letters.sort_unstable();
        if letters != ['C', 'T', 'X', 'Y', 'Z'] {
            return Err(ConvertError::invalid(format!(
                "dimension order must be a permutation of XYCZT, got '{}'",
                s
            )));
        }
        Ok(Self(order))
    }
}

impl TryFrom<String> for DimensionOrder {
    type Error = ConvertError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DimensionOrder> for String {
    fn from(order: DimensionOrder) -> Self {
        order.0
    }
}

// =============================================================================
// Plane Counts and Ranges
// =============================================================================

/// Number of Z and T planes in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneCounts {
    pub z: u32,
    pub t: u32,
}

impl PlaneCounts {
    pub fn new(z: u32, t: u32) -> Self {
        Self { z, t }
    }

    /// Total number of Z/T planes.
    pub fn planes(&self) -> u32 {
        self.z.max(1) * self.t.max(1)
    }
}

/// Inclusive 1-based range of plane indices.
///
/// An `end` of 0 means a single plane at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneRange {
    pub start: u32,
    pub end: u32,
}

impl PlaneRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn single(index: u32) -> Self {
        Self {
            start: index,
            end: index,
        }
    }

    fn bounds(&self) -> (u32, u32) {
        let end = if self.end == 0 { self.start } else { self.end };
        (self.start, end)
    }
}

impl FromStr for PlaneRange {
    type Err = ConvertError;

    /// Parses `"3"` or `"3-7"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| ConvertError::invalid(format!("invalid plane index '{}'", v)))
        };
        match s.split_once('-') {
            Some((a, b)) => Ok(Self::new(parse(a)?, parse(b)?)),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

// =============================================================================
// Page Computation
// =============================================================================

/// 1-based page holding plane (`z`, `t`).
///
/// - one time point: page = z
/// - one Z plane: page = t
/// - Z faster than T: page = (t - 1) * z_count + z
/// - T faster than Z: page = (z - 1) * t_count + t
///
/// Returns `None` when the page does not fit in a `u32`.
pub fn page_number(z: u32, t: u32, counts: PlaneCounts, order: &DimensionOrder) -> Option<u32> {
    if counts.t <= 1 {
        Some(z)
    } else if counts.z <= 1 {
        Some(t)
    } else if order.z_iterates_faster() {
        t.saturating_sub(1).checked_mul(counts.z)?.checked_add(z)
    } else {
        z.saturating_sub(1).checked_mul(counts.t)?.checked_add(t)
    }
}

/// Pages for every plane in the given ranges, T outer and Z inner.
///
/// Both ranges must lie within `counts`; a range that runs backwards or past
/// the last plane is rejected.
pub fn pages_for_ranges(
    z: PlaneRange,
    t: PlaneRange,
    counts: PlaneCounts,
    order: &DimensionOrder,
) -> Result<Vec<u32>, ConvertError> {
    let (z1, z2) = checked_bounds("z", z, counts.z)?;
    let (t1, t2) = checked_bounds("t", t, counts.t)?;

    let mut pages = Vec::with_capacity(((z2 - z1 + 1) as usize) * ((t2 - t1 + 1) as usize));
    for ti in t1..=t2 {
        for zi in z1..=z2 {
            let page = page_number(zi, ti, counts, order).ok_or_else(|| {
                ConvertError::invalid(format!("page for z={} t={} overflows", zi, ti))
            })?;
            pages.push(page);
        }
    }
    Ok(pages)
}

fn checked_bounds(axis: &str, range: PlaneRange, count: u32) -> Result<(u32, u32), ConvertError> {
    let (start, end) = range.bounds();
    let count = count.max(1);
    if start == 0 {
        return Err(ConvertError::invalid("plane indices are 1-based"));
    }
    if start > end {
        return Err(ConvertError::invalid(format!(
            "{} range {}-{} runs backwards",
            axis, start, end
        )));
    }
    if end > count {
        return Err(ConvertError::invalid(format!(
            "{} range {}-{} exceeds {} planes",
            axis, start, end, count
        )));
    }
    Ok((start, end))
}

/// 0-based file indices for pages of a multi-file series with one file per
/// channel plane. Each page expands to `channels` consecutive files.
pub fn expand_channels(pages: &[u32], channels: u32) -> Vec<usize> {
    let channels = channels.max(1) as usize;
    pages
        .iter()
        .flat_map(|&page| {
            let first = page.saturating_sub(1) as usize * channels;
            first..first + channels
        })
        .collect()
}

/// 0-based index of the plane used for previews: the middle Z plane, or the
/// middle time point (limited to the first 500) for time series.
pub fn middle_plane(counts: PlaneCounts) -> u32 {
    if counts.z <= 1 && counts.t <= 1 {
        return 0;
    }
    let span = if counts.z > 1 {
        counts.z
    } else {
        counts.t.min(MIDDLE_PLANE_T_LIMIT)
    };
    (span - 1) / 2
}

// =============================================================================
// Tests
// =============================================================================
