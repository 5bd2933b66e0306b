//! Resolution level selection for pyramidal images.

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// Pre-computed resolution levels of a pyramidal image.
///
/// Level 0 is the base image; each level has a scale factor relative to it
/// (1.0, 0.5, 0.25, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLevels {
    /// Width of the base level in pixels
    pub width: u32,

    /// Height of the base level in pixels
    pub height: u32,

    /// Per-level scale factors, level 0 first
    pub scales: Vec<f64>,
}

impl ResolutionLevels {
    pub fn new(width: u32, height: u32, scales: Vec<f64>) -> Self {
        Self {
            width,
            height,
            scales,
        }
    }

    /// Parse the converter's comma-separated scale list (`"1.0,0.5,0.25"`).
    pub fn parse_scales(value: &str) -> Result<Vec<f64>, ConvertError> {
        value
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| ConvertError::invalid(format!("invalid level scale '{}'", s)))
            })
            .collect()
    }

    pub fn level_count(&self) -> usize {
        self.scales.len()
    }

    /// Pixel size of a level, rounded to the nearest pixel.
    pub fn level_size(&self, level: usize) -> Option<(u32, u32)> {
        let scale = *self.scales.get(level)?;
        Some((
            (self.width as f64 * scale).round() as u32,
            (self.height as f64 * scale).round() as u32,
        ))
    }

    /// Smallest level that still covers `width` x `height`.
    ///
    /// For each level the relative size `max(width / level_w, height / level_h)`
    /// is computed. Levels with a relative size above 1 are too small and are
    /// discarded; among the rest the one closest to 1 (least oversized) wins.
    /// Ties go to the lower level index. Falls back to level 0.
    pub fn best_level_for_size(&self, width: u32, height: u32) -> usize {
        let mut best: Option<(usize, f64)> = None;

        for level in 0..self.level_count() {
            let Some((lw, lh)) = self.level_size(level) else {
                continue;
            };
            if lw == 0 || lh == 0 {
                continue;
            }
            let relative = (width as f64 / lw as f64).max(height as f64 / lh as f64);
            if relative > 1.0 {
                continue;
            }
            match best {
                Some((_, r)) if r >= relative => {}
                _ => best = Some((level, relative)),
            }
        }

        best.map(|(level, _)| level).unwrap_or(0)
    }
}
