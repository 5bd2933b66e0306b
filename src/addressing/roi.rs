//! Region of interest conversion.
//!
//! Callers pass ROI bounds as 1-based inclusive pixel coordinates. The
//! converter expects 0-based coordinates, but an axis is only converted when
//! its two bounds differ: a degenerate axis (`x1 == x2`) is passed through
//! untouched. When both axes are degenerate no ROI is emitted at all.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// Pixel rectangle given as two corners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Roi {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Whether both axes are degenerate, i.e. no ROI was requested.
    pub fn is_empty(&self) -> bool {
        self.x1 == self.x2 && self.y1 == self.y2
    }

    /// Converter coordinates, or `None` when no ROI applies.
    pub fn to_converter(&self) -> Option<Roi> {
        if self.is_empty() {
            return None;
        }

        let mut roi = *self;
        if roi.x1 != roi.x2 {
            roi.x1 = roi.x1.saturating_sub(1);
            roi.x2 = roi.x2.saturating_sub(1);
        }
        if roi.y1 != roi.y2 {
            roi.y1 = roi.y1.saturating_sub(1);
            roi.y2 = roi.y2.saturating_sub(1);
        }
        Some(roi)
    }

    /// `-roi` argument value: `x1,y1,x2,y2`.
    pub fn to_arg(&self) -> String {
        format!("{},{},{},{}", self.x1, self.y1, self.x2, self.y2)
    }
}

impl FromStr for Roi {
    type Err = ConvertError;

    /// Parses `x1,y1,x2,y2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConvertError::invalid(format!("invalid ROI '{}'", s)))?;

        match values.as_slice() {
            [x1, y1, x2, y2] => Ok(Roi::new(*x1, *y1, *x2, *y2)),
            _ => Err(ConvertError::invalid(format!(
                "ROI needs four values x1,y1,x2,y2, got '{}'",
                s
            ))),
        }
    }
}
