//! Parsing of the converter's `tag: value` metadata listings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata tags mapped to typed values, ordered by tag.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Tags kept by `-meta-parsed` info queries.
pub const INFO_KEYS: &[&str] = &[
    "image_num_x",
    "image_num_y",
    "image_num_z",
    "image_num_t",
    "image_num_c",
    "image_num_p",
    "image_num_series",
    "image_series_index",
    "image_num_fovs",
    "image_num_labels",
    "image_num_previews",
    "format",
    "file_mode",
    "image_mode",
    "image_pixel_format",
    "image_pixel_depth",
    "raw_endian",
    "dimensions",
    "pixel_resolution_x",
    "pixel_resolution_y",
    "pixel_resolution_z",
    "pixel_resolution_unit_x",
    "pixel_resolution_unit_y",
    "pixel_resolution_unit_z",
    "image_num_resolution_levels",
    "image_resolution_level_scales",
    "tile_num_x",
    "tile_num_y",
];

/// A metadata value, typed the way it parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    /// Integer if it parses as one, then float, then text.
    pub fn parse(value: &str) -> Self {
        if let Ok(i) = value.parse::<i64>() {
            MetaValue::Int(i)
        } else if let Ok(f) = value.parse::<f64>() {
            MetaValue::Float(f)
        } else {
            MetaValue::Text(value.to_string())
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            MetaValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            MetaValue::Float(_) => None,
            MetaValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|i| u32::try_from(i).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::Float(f) => Some(*f),
            MetaValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(i) => write!(f, "{}", i),
            MetaValue::Float(v) => write!(f, "{}", v),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u32> for MetaValue {
    fn from(value: u32) -> Self {
        MetaValue::Int(value as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

// =============================================================================
// Listing Parser
// =============================================================================

/// Which tags a listing parse keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    All,
    Info,
}

/// Parse a full `-meta` listing.
///
/// Tags and values are percent-decoded. When a tag repeats, the first
/// `image_num_z`/`image_num_t` wins; plane counts found in an ImageJ
/// `ImageDescription` override both.
pub fn parse_meta(listing: &str) -> Metadata {
    let mut meta = parse_listing(listing, Selection::All);
    finish(&mut meta);
    meta
}

/// Parse a `-meta-parsed` listing, keeping only [`INFO_KEYS`].
///
/// Plane counts default to 1.
pub fn parse_info(listing: &str) -> Metadata {
    let mut meta = parse_listing(listing, Selection::Info);
    for key in ["image_num_z", "image_num_t", "image_num_p"] {
        meta.entry(key.to_string()).or_insert(MetaValue::Int(1));
    }
    finish(&mut meta);
    meta
}

fn parse_listing(listing: &str, selection: Selection) -> Metadata {
    let mut meta = Metadata::new();
    let mut imagej: (Option<u32>, Option<u32>) = (None, None);

    for line in listing.lines() {
        let Some((tag, value)) = line.split_once(':') else {
            continue;
        };
        let tag = decode(tag.trim());
        let value = decode(value.trim());
        if value.is_empty() {
            continue;
        }

        if tag.ends_with("ImageDescription") && value.starts_with("ImageJ") {
            let (z, t) = parse_imagej(&value);
            imagej = (z.or(imagej.0), t.or(imagej.1));
        }

        if (tag == "image_num_z" || tag == "image_num_t") && meta.contains_key(&tag) {
            continue;
        }
        if selection == Selection::Info && !INFO_KEYS.contains(&tag.as_str()) {
            continue;
        }
        meta.insert(tag, MetaValue::parse(&value));
    }

    if let Some(z) = imagej.0 {
        meta.insert("image_num_z".to_string(), z.into());
    }
    if let Some(t) = imagej.1 {
        meta.insert("image_num_t".to_string(), t.into());
    }
    meta
}

/// Normalizations shared by both listing kinds.
fn finish(meta: &mut Metadata) {
    if let Some(MetaValue::Text(dims)) = meta.get_mut("dimensions") {
        dims.retain(|c| c != ' ');
    }

    let pages = count(meta, "image_num_p");
    if count(meta, "image_num_z") == 1 && count(meta, "image_num_t") == 1 && pages > 1 {
        meta.insert("image_num_z".to_string(), MetaValue::Int(pages));
    }

    for key in ["image_num_series", "image_series_index"] {
        meta.entry(key.to_string()).or_insert(MetaValue::Int(0));
    }
}

fn count(meta: &Metadata, key: &str) -> i64 {
    meta.get(key).and_then(MetaValue::as_i64).unwrap_or(0)
}

/// `slices=` and `frames=` from an ImageJ description block.
fn parse_imagej(description: &str) -> (Option<u32>, Option<u32>) {
    let mut slices = None;
    let mut frames = None;
    for line in description.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "slices" => slices = value.trim().parse().ok(),
            "frames" => frames = value.trim().parse().ok(),
            _ => {}
        }
    }
    (slices, frames)
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Add `channels/channel_NNNNN/{name,color}` aliases for per-channel tags.
pub fn add_channel_paths(meta: &mut Metadata) {
    let channels = meta
        .get("image_num_c")
        .and_then(MetaValue::as_u32)
        .unwrap_or(0);
    for i in 0..channels {
        let path = format!("channels/channel_{:05}", i);
        if let Some(name) = meta.get(&format!("channel_{}_name", i)).cloned() {
            meta.insert(format!("{}/name", path), name);
        }
        if let Some(color) = meta.get(&format!("channel_color_{}", i)).cloned() {
            meta.insert(format!("{}/color", path), color);
        }
    }
}
