//! Conversion tokens: the logical input of a request.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::addressing::{DimensionOrder, PlaneCounts, ResolutionLevels};
use crate::series::{Geometry, SeriesGroup};

use super::meta::{MetaValue, Metadata};

// =============================================================================
// Image Dimensions
// =============================================================================

/// Core image geometry as reported by an info query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
    pub z: u32,
    pub t: u32,
    pub channels: u32,
    pub pages: u32,

    /// Bits per sample, when known
    pub depth: Option<u32>,

    pub dimension_order: DimensionOrder,

    pub resolution_levels: u32,
    pub level_scales: Vec<f64>,
    pub tile_width: u32,
    pub tile_height: u32,

    /// Pixel size along X, Y, Z and T
    pub pixel_resolution: [f64; 4],

    pub series_count: u32,
    pub series_index: u32,
    pub format: Option<String>,
}

impl Default for ImageDims {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            z: 1,
            t: 1,
            channels: 1,
            pages: 1,
            depth: None,
            dimension_order: DimensionOrder::default(),
            resolution_levels: 1,
            level_scales: Vec::new(),
            tile_width: 0,
            tile_height: 0,
            pixel_resolution: [0.0; 4],
            series_count: 0,
            series_index: 0,
            format: None,
        }
    }
}

impl ImageDims {
    /// Build from parsed converter metadata. Missing or malformed tags keep
    /// their defaults.
    pub fn from_meta(meta: &Metadata) -> Self {
        let defaults = Self::default();
        let int = |key: &str, default: u32| {
            meta.get(key)
                .and_then(MetaValue::as_u32)
                .unwrap_or(default)
        };
        let float = |key: &str| meta.get(key).and_then(MetaValue::as_f64).unwrap_or(0.0);

        let dimension_order = meta
            .get("dimensions")
            .and_then(|v| v.to_string().parse().ok())
            .unwrap_or_default();

        let level_scales = meta
            .get("image_resolution_level_scales")
            .and_then(|v| ResolutionLevels::parse_scales(&v.to_string()).ok())
            .unwrap_or_default();

        Self {
            width: int("image_num_x", defaults.width),
            height: int("image_num_y", defaults.height),
            z: int("image_num_z", defaults.z).max(1),
            t: int("image_num_t", defaults.t).max(1),
            channels: int("image_num_c", defaults.channels),
            pages: int("image_num_p", defaults.pages),
            depth: meta.get("image_pixel_depth").and_then(MetaValue::as_u32),
            dimension_order,
            resolution_levels: int("image_num_resolution_levels", defaults.resolution_levels),
            level_scales,
            tile_width: int("tile_num_x", 0),
            tile_height: int("tile_num_y", 0),
            pixel_resolution: [
                float("pixel_resolution_x"),
                float("pixel_resolution_y"),
                float("pixel_resolution_z"),
                float("pixel_resolution_t"),
            ],
            series_count: int("image_num_series", 0),
            series_index: int("image_series_index", 0),
            format: meta.get("format").map(|v| v.to_string()),
        }
    }

    pub fn counts(&self) -> PlaneCounts {
        PlaneCounts::new(self.z, self.t)
    }

    /// Pyramid description, for images with more than one resolution level.
    pub fn levels(&self) -> Option<ResolutionLevels> {
        if self.resolution_levels <= 1 || self.level_scales.is_empty() {
            return None;
        }
        Some(ResolutionLevels::new(
            self.width,
            self.height,
            self.level_scales.clone(),
        ))
    }

    pub fn is_tiled(&self) -> bool {
        self.resolution_levels > 1 && self.tile_width > 0 && self.tile_height > 0
    }
}

// =============================================================================
// Series Metadata
// =============================================================================

/// Geometry of a multi-file series, one file per plane (or per channel plane).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesMeta {
    pub z: u32,
    pub t: u32,
    pub channels: u32,

    /// Pixel size along X, Y, Z and T
    pub resolution: [f64; 4],
}

impl SeriesMeta {
    pub fn new(z: u32, t: u32, channels: u32) -> Self {
        Self {
            z: z.max(1),
            t: t.max(1),
            channels,
            resolution: [0.0; 4],
        }
    }

    /// Geometry of an assembled group. The channel count stays unknown.
    pub fn from_geometry(geometry: Geometry) -> Self {
        Self::new(geometry.z, geometry.t, 0)
    }

    pub fn with_resolution(mut self, resolution: [f64; 4]) -> Self {
        self.resolution = resolution;
        self
    }

    /// Metadata tags that override what the converter reports for the first file.
    pub fn to_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("image_num_z".to_string(), self.z.into());
        meta.insert("image_num_t".to_string(), self.t.into());
        if self.channels > 0 {
            meta.insert("image_num_c".to_string(), self.channels.into());
        }
        for (axis, value) in ["x", "y", "z", "t"].iter().zip(self.resolution) {
            if value > 0.0 {
                meta.insert(format!("pixel_resolution_{}", axis), value.into());
            }
        }
        meta
    }
}

// =============================================================================
// Conversion Token
// =============================================================================

/// One logical input: a single file, or an ordered multi-file series.
///
/// Built once by the caller and never modified by the converter; operations
/// that address a subset of a series select files into their own command plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionToken {
    inputs: Vec<PathBuf>,
    dims: ImageDims,
    series_meta: Option<SeriesMeta>,
    series: Option<String>,
    histogram: Option<PathBuf>,
    queue: Vec<String>,
    speed_file: Option<PathBuf>,
}

impl ConversionToken {
    pub fn single(input: impl Into<PathBuf>) -> Self {
        Self {
            inputs: vec![input.into()],
            dims: ImageDims::default(),
            series_meta: None,
            series: None,
            histogram: None,
            queue: Vec::new(),
            speed_file: None,
        }
    }

    /// A series of files ordered by plane.
    pub fn multifile(inputs: Vec<PathBuf>, meta: SeriesMeta) -> Self {
        Self {
            series_meta: Some(meta),
            inputs,
            ..Self::single(PathBuf::new())
        }
    }

    pub fn with_dims(mut self, dims: ImageDims) -> Self {
        self.dims = dims;
        self
    }

    /// Sub-image selector passed as `-path`.
    pub fn with_series_path(mut self, series: impl Into<String>) -> Self {
        self.series = Some(series.into());
        self
    }

    /// Histogram file used to normalize conversions (`-ihst`).
    pub fn with_histogram(mut self, path: impl Into<PathBuf>) -> Self {
        self.histogram = Some(path.into());
        self
    }

    /// Flags already chosen by earlier processing steps.
    pub fn with_queue(mut self, queue: Vec<String>) -> Self {
        self.queue = queue;
        self
    }

    /// File where the converter records tile read statistics (`-speed`).
    pub fn with_speed_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.speed_file = Some(path.into());
        self
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn first_input_file(&self) -> Option<&Path> {
        self.inputs.first().map(PathBuf::as_path)
    }

    pub fn is_multifile_series(&self) -> bool {
        self.series_meta.is_some()
    }

    pub fn series_meta(&self) -> Option<&SeriesMeta> {
        self.series_meta.as_ref()
    }

    /// Non-empty, non-zero `-path` selector.
    pub fn series(&self) -> Option<&str> {
        self.series
            .as_deref()
            .filter(|s| !s.is_empty() && *s != "0")
    }

    pub fn histogram(&self) -> Option<&Path> {
        self.histogram.as_deref()
    }

    pub fn queue(&self) -> &[String] {
        &self.queue
    }

    pub fn speed_file(&self) -> Option<&Path> {
        self.speed_file.as_deref()
    }

    /// Dimensions with multi-file series geometry applied.
    pub fn dims(&self) -> ImageDims {
        let mut dims = self.dims.clone();
        if let Some(meta) = &self.series_meta {
            dims.z = meta.z;
            dims.t = meta.t;
            if meta.channels > 0 {
                dims.channels = meta.channels;
            }
            for (current, value) in dims.pixel_resolution.iter_mut().zip(meta.resolution) {
                if value > 0.0 {
                    *current = value;
                }
            }
        }
        dims
    }

    /// Channel count used to lay out files of a multi-file series.
    pub(crate) fn series_channels(&self) -> u32 {
        self.series_meta.map(|m| m.channels).unwrap_or(0)
    }
}

impl From<&SeriesGroup> for ConversionToken {
    fn from(group: &SeriesGroup) -> Self {
        Self::multifile(group.files(), SeriesMeta::from_geometry(group.geometry))
    }
}
