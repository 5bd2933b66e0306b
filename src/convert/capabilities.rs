//! Converter capability descriptor.
//!
//! Probed once at startup and shared by reference. Replaces mutable
//! "installed" flags: an engine built around a not-installed descriptor
//! fails every operation with [`ConvertError::ConfigurationMissing`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::ConvertError;

use super::backend::{ConverterBackend, ExitClass, ProcessOutput};

/// Oldest converter release the command construction is written against.
pub const REQUIRED_VERSION: ConverterVersion = ConverterVersion::new(2, 0, 1);

// =============================================================================
// Version
// =============================================================================

/// `major.minor.build` converter version. A missing build number is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConverterVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl ConverterVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

impl fmt::Display for ConverterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

impl FromStr for ConverterVersion {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .trim()
            .split('.')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConvertError::ConfigurationMissing {
                reason: format!("unrecognized converter version '{}'", s.trim()),
            })?;

        match parts.as_slice() {
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, build, ..] => Ok(Self::new(*major, *minor, *build)),
            _ => Err(ConvertError::ConfigurationMissing {
                reason: format!("unrecognized converter version '{}'", s.trim()),
            }),
        }
    }
}

// =============================================================================
// Formats
// =============================================================================

/// One codec supported by the converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatInfo {
    pub name: String,
    pub full_name: String,
    pub extensions: Vec<String>,
    pub reading: bool,
    pub writing: bool,
    pub multipage: bool,
    pub metadata: bool,
    pub samples: (u32, u32),
    pub bits: (u32, u32),
}

/// Parse the `-fmtxml` codec listing, keyed by lowercase codec name.
///
/// Codecs missing any of the descriptive tags are skipped.
pub fn parse_formats_xml(xml: &str) -> Result<BTreeMap<String, FormatInfo>, roxmltree::Error> {
    let wrapped = format!("<formats>{}</formats>", xml);
    let doc = roxmltree::Document::parse(&wrapped)?;

    let mut formats = BTreeMap::new();
    for codec in doc.descendants().filter(|n| n.has_tag_name("codec")) {
        let Some(name) = codec.attribute("name") else {
            continue;
        };
        match parse_codec(name, codec) {
            Some(format) => {
                formats.insert(name.to_lowercase(), format);
            }
            None => warn!(codec = name, "Skipping codec with incomplete description"),
        }
    }
    Ok(formats)
}

fn parse_codec(name: &str, codec: roxmltree::Node<'_, '_>) -> Option<FormatInfo> {
    let tags: Vec<(&str, &str)> = codec
        .children()
        .filter(|n| n.has_tag_name("tag"))
        .filter_map(|n| Some((n.attribute("name")?, n.attribute("value").unwrap_or(""))))
        .collect();

    let value = |key: &str| tags.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
    let number = |key: &str| value(key).map(|v| v.trim().parse::<u32>().unwrap_or(0));
    let supports = |what: &str| tags.iter().any(|(k, v)| *k == "support" && *v == what);

    Some(FormatInfo {
        name: name.to_string(),
        full_name: value("fullname")?.to_string(),
        extensions: value("extensions")?
            .split('|')
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect(),
        reading: supports("reading"),
        writing: supports("writing"),
        multipage: supports("writing multiple pages"),
        metadata: supports("reading metadata") || supports("writing metadata"),
        samples: (
            number("min-samples-per-pixel")?,
            number("max-samples-per-pixel")?,
        ),
        bits: (number("min-bits-per-sample")?, number("max-bits-per-sample")?),
    })
}

// =============================================================================
// Capabilities
// =============================================================================

/// What the installed converter can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub command: String,
    pub installed: bool,
    pub version: Option<ConverterVersion>,
    pub formats: BTreeMap<String, FormatInfo>,
}

impl Capabilities {
    /// Descriptor for a converter that is missing or unusable.
    pub fn not_installed(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            installed: false,
            version: None,
            formats: BTreeMap::new(),
        }
    }

    /// Descriptor for a known converter, without probing.
    pub fn installed(
        command: impl Into<String>,
        version: ConverterVersion,
        formats: BTreeMap<String, FormatInfo>,
    ) -> Self {
        Self {
            command: command.into(),
            installed: version >= REQUIRED_VERSION,
            version: Some(version),
            formats,
        }
    }

    /// Ask the converter for its version and codec table.
    ///
    /// Never fails: an unreachable or outdated converter yields a
    /// not-installed descriptor.
    pub async fn probe(backend: &dyn ConverterBackend, command: impl Into<String>) -> Self {
        let command = command.into();

        let version = match query(backend, "-v").await {
            Some(out) => match out.stdout.parse::<ConverterVersion>() {
                Ok(v) => v,
                Err(e) => {
                    warn!(command = %command, error = %e, "Converter is too old");
                    return Self::not_installed(command);
                }
            },
            None => return Self::not_installed(command),
        };

        if version < REQUIRED_VERSION {
            warn!(
                command = %command,
                %version,
                required = %REQUIRED_VERSION,
                "Converter version is below the required version"
            );
            return Self {
                version: Some(version),
                ..Self::not_installed(command)
            };
        }

        let formats = match query(backend, "-fmtxml").await {
            Some(out) => parse_formats_xml(&out.stdout).unwrap_or_else(|e| {
                warn!(error = %e, "Could not parse converter format table");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        info!(command = %command, %version, formats = formats.len(), "Converter available");
        Self::installed(command, version, formats)
    }

    pub fn require_installed(&self) -> Result<(), ConvertError> {
        if self.installed {
            return Ok(());
        }
        let reason = match self.version {
            Some(v) => format!(
                "{} version {} is older than required {}",
                self.command, v, REQUIRED_VERSION
            ),
            None => format!("{} is not installed", self.command),
        };
        Err(ConvertError::ConfigurationMissing { reason })
    }

    pub fn format(&self, name: &str) -> Option<&FormatInfo> {
        self.formats.get(&name.to_lowercase())
    }
}

/// Run a query flag, retrying a transient exit once.
async fn query(backend: &dyn ConverterBackend, flag: &str) -> Option<ProcessOutput> {
    let args = [flag.to_string()];
    for _ in 0..2 {
        match backend.invoke(&args).await {
            Ok(out) if out.class() == ExitClass::Transient => continue,
            Ok(out) if out.class() == ExitClass::Success => return Some(out),
            Ok(out) => {
                warn!(flag, code = out.code, "Converter query failed");
                return None;
            }
            Err(e) => {
                warn!(flag, error = %e, "Converter could not be started");
                return None;
            }
        }
    }
    None
}
