//! Conversion requests and their parameter parsing.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::addressing::{PlaneRange, Roi};
use crate::error::ConvertError;

/// Dimensions beyond X, Y, C, Z and T that a slice can select.
pub const EXTENDED_DIMENSIONS: &[&str] = &[
    "serie",
    "fov",
    "rotation",
    "scene",
    "illumination",
    "phase",
    "view",
    "label",
    "preview",
];

const DEFAULT_THUMBNAIL_SIZE: (u32, u32) = (128, 128);

// =============================================================================
// Output Policy
// =============================================================================

/// What to do when the output path already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Treat an existing output as busy (another writer produced it)
    #[default]
    FailIfExists,

    /// Run the converter over the existing output
    Overwrite,

    /// Return an existing non-trivial output without running the converter
    SkipIfExists,
}

impl FromStr for OutputPolicy {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" | "fail-if-exists" => Ok(OutputPolicy::FailIfExists),
            "overwrite" => Ok(OutputPolicy::Overwrite),
            "skip" | "skip-if-exists" => Ok(OutputPolicy::SkipIfExists),
            _ => Err(ConvertError::invalid(format!(
                "unknown output policy '{}'",
                s
            ))),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// An image-processing operation and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// Preview of the middle plane, resized to fit `width` x `height`
    Thumbnail {
        width: u32,
        height: u32,
        format: String,
        method: String,
    },

    /// Planes selected by Z/T ranges, optionally cropped
    Slice {
        z: PlaneRange,
        t: PlaneRange,
        roi: Roi,
        format: String,
        extended: Vec<(String, String)>,
    },

    /// One tile of a pyramid level
    Tile {
        level: u32,
        x: u32,
        y: u32,
        size: u32,
        format: String,
    },

    /// Whole-image format conversion
    Convert {
        format: Option<String>,
        extra: Vec<String>,
    },

    /// Pixel histogram written in the converter's own format
    Histogram,

    Meta,
    Info,
    Supported,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Thumbnail { .. } => "thumbnail",
            Operation::Slice { .. } => "slice",
            Operation::Tile { .. } => "tile",
            Operation::Convert { .. } => "convert",
            Operation::Histogram => "histogram",
            Operation::Meta => "meta",
            Operation::Info => "info",
            Operation::Supported => "supported",
        }
    }

    /// Whether the operation produces an output file.
    pub fn writes_output(&self) -> bool {
        !matches!(
            self,
            Operation::Meta | Operation::Info | Operation::Supported
        )
    }

    /// Parse an operation from its name and `key=value` parameters.
    ///
    /// | operation | parameters |
    /// |-----------|------------|
    /// | thumbnail | `resize=w,h`, `format`, `method` |
    /// | slice     | `z`, `t` (`n` or `a-b`), `roi=x1,y1,x2,y2`, `format`, extended dimensions |
    /// | tile      | `tile=level,x,y,size`, `format` |
    /// | convert   | `format`, `extra` (whitespace separated flags) |
    pub fn parse(name: &str, params: &[(String, String)]) -> Result<Self, ConvertError> {
        let p = Params(params);
        let op = match name {
            "thumbnail" => {
                p.only(&["resize", "format", "method"], name)?;
                let (width, height) = match p.get("resize") {
                    Some(v) => parse_pair(v)?,
                    None => DEFAULT_THUMBNAIL_SIZE,
                };
                Operation::Thumbnail {
                    width,
                    height,
                    format: p.get("format").unwrap_or("jpeg").to_string(),
                    method: p.get("method").unwrap_or("BC").to_string(),
                }
            }
            "slice" => {
                let mut known = vec!["z", "t", "roi", "format"];
                known.extend_from_slice(EXTENDED_DIMENSIONS);
                p.only(&known, name)?;

                let mut extended = Vec::new();
                for (key, value) in params {
                    if EXTENDED_DIMENSIONS.contains(&key.as_str()) {
                        if value.contains('-') || value.contains(',') {
                            return Err(ConvertError::invalid(format!(
                                "ranges in extended dimension '{}' are not supported",
                                key
                            )));
                        }
                        extended.push((key.clone(), value.trim().to_string()));
                    }
                }

                Operation::Slice {
                    z: p.parse_or("z", PlaneRange::single(1))?,
                    t: p.parse_or("t", PlaneRange::single(1))?,
                    roi: p.parse_or("roi", Roi::default())?,
                    format: p.get("format").unwrap_or("bigtiff").to_string(),
                    extended,
                }
            }
            "tile" => {
                p.only(&["tile", "format"], name)?;
                let spec = p
                    .get("tile")
                    .ok_or_else(|| ConvertError::invalid("tile requires tile=level,x,y,size"))?;
                let values = parse_list(spec)?;
                let [level, x, y, size] = values[..] else {
                    return Err(ConvertError::invalid(format!(
                        "tile needs level,x,y,size, got '{}'",
                        spec
                    )));
                };
                Operation::Tile {
                    level,
                    x,
                    y,
                    size,
                    format: p.get("format").unwrap_or("tiff").to_string(),
                }
            }
            "convert" => {
                p.only(&["format", "extra"], name)?;
                Operation::Convert {
                    format: p.get("format").map(str::to_string),
                    extra: p
                        .get("extra")
                        .map(|e| e.split_whitespace().map(str::to_string).collect())
                        .unwrap_or_default(),
                }
            }
            "histogram" => Operation::Histogram,
            "meta" => Operation::Meta,
            "info" => Operation::Info,
            "supported" => Operation::Supported,
            other => {
                return Err(ConvertError::invalid(format!(
                    "unknown operation '{}'",
                    other
                )))
            }
        };
        Ok(op)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Request
// =============================================================================

/// One call into the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionRequest {
    pub operation: Operation,
    pub output: Option<PathBuf>,
    pub policy: OutputPolicy,

    /// Give up instead of waiting when the output is still being read or written
    pub fail_on_read: bool,
}

impl ConversionRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            output: None,
            policy: OutputPolicy::default(),
            fail_on_read: false,
        }
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_policy(mut self, policy: OutputPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fail_on_read(mut self, value: bool) -> Self {
        self.fail_on_read = value;
        self
    }

    /// Build a request from an operation name and string parameters.
    ///
    /// `policy` and `fail_on_read` are request-level parameters; everything
    /// else goes to [`Operation::parse`].
    pub fn from_params(
        name: &str,
        params: &[(String, String)],
        output: Option<PathBuf>,
    ) -> Result<Self, ConvertError> {
        let mut op_params = Vec::with_capacity(params.len());
        let mut request_policy = OutputPolicy::default();
        let mut fail_on_read = false;

        for (key, value) in params {
            match key.as_str() {
                "policy" => request_policy = value.parse()?,
                "fail_on_read" => fail_on_read = parse_bool(value)?,
                _ => op_params.push((key.clone(), value.clone())),
            }
        }

        let request = Self {
            operation: Operation::parse(name, &op_params)?,
            output,
            policy: request_policy,
            fail_on_read,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check that the output path matches the operation.
    pub fn validate(&self) -> Result<(), ConvertError> {
        match (&self.output, self.operation.writes_output()) {
            (None, true) => Err(ConvertError::invalid(format!(
                "{} requires an output path",
                self.operation
            ))),
            (Some(_), false) => Err(ConvertError::invalid(format!(
                "{} does not write an output file",
                self.operation
            ))),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Parameter Helpers
// =============================================================================

struct Params<'a>(&'a [(String, String)]);

impl<'a> Params<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConvertError>
    where
        T: FromStr<Err = ConvertError>,
    {
        match self.get(key) {
            Some(v) => v.parse(),
            None => Ok(default),
        }
    }

    fn only(&self, known: &[&str], operation: &str) -> Result<(), ConvertError> {
        match self.0.iter().find(|(k, _)| !known.contains(&k.as_str())) {
            Some((key, _)) => Err(ConvertError::invalid(format!(
                "unknown parameter '{}' for {}",
                key, operation
            ))),
            None => Ok(()),
        }
    }
}

fn parse_list(value: &str) -> Result<Vec<u32>, ConvertError> {
    value
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| ConvertError::invalid(format!("invalid number '{}'", v)))
        })
        .collect()
}

fn parse_pair(value: &str) -> Result<(u32, u32), ConvertError> {
    match parse_list(value)?[..] {
        [w, h] => Ok((w, h)),
        _ => Err(ConvertError::invalid(format!(
            "expected width,height, got '{}'",
            value
        ))),
    }
}

fn parse_bool(value: &str) -> Result<bool, ConvertError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConvertError::invalid(format!("invalid boolean '{}'", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_thumbnail_defaults() {
        let op = Operation::parse("thumbnail", &[]).unwrap();
        assert_eq!(
            op,
            Operation::Thumbnail {
                width: 128,
                height: 128,
                format: "jpeg".to_string(),
                method: "BC".to_string(),
            }
        );
    }

    #[test]
    fn test_slice_parameters() {
        let op = Operation::parse(
            "slice",
            &params(&[("z", "2-4"), ("t", "3"), ("roi", "1,1,64,64"), ("fov", "2")]),
        )
        .unwrap();
        match op {
            Operation::Slice {
                z, t, roi, extended, ..
            } => {
                assert_eq!(z, PlaneRange::new(2, 4));
                assert_eq!(t, PlaneRange::single(3));
                assert_eq!(roi, Roi::new(1, 1, 64, 64));
                assert_eq!(extended, vec![("fov".to_string(), "2".to_string())]);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_extended_dimension_range_rejected() {
        let err = Operation::parse("slice", &params(&[("scene", "1-3")])).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidRequest { .. }));
    }

    #[test]
    fn test_tile_parameters() {
        let op = Operation::parse("tile", &params(&[("tile", "2,3,4,512")])).unwrap();
        assert!(matches!(
            op,
            Operation::Tile {
                level: 2,
                x: 3,
                y: 4,
                size: 512,
                ..
            }
        ));
        assert!(Operation::parse("tile", &params(&[("tile", "2,3")])).is_err());
        assert!(Operation::parse("tile", &[]).is_err());
    }

    #[test]
    fn test_unknown_operation_and_parameter() {
        assert!(Operation::parse("sharpen", &[]).is_err());
        assert!(Operation::parse("thumbnail", &params(&[("zoom", "2")])).is_err());
    }

    #[test]
    fn test_request_level_params() {
        let request = ConversionRequest::from_params(
            "convert",
            &params(&[("format", "ome-tiff"), ("policy", "overwrite"), ("fail_on_read", "yes")]),
            Some(PathBuf::from("/tmp/out.ome.tif")),
        )
        .unwrap();
        assert_eq!(request.policy, OutputPolicy::Overwrite);
        assert!(request.fail_on_read);
    }

    #[test]
    fn test_output_required_for_writers() {
        assert!(ConversionRequest::from_params("thumbnail", &[], None).is_err());
        assert!(ConversionRequest::from_params("meta", &[], None).is_ok());
        assert!(
            ConversionRequest::from_params("meta", &[], Some(PathBuf::from("/tmp/x"))).is_err()
        );
    }
}
