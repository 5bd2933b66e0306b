//! Grouping and ordering of probed files.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

// =============================================================================
// Probe Types
// =============================================================================

/// Identity shared by every file of one series.
///
/// Compared field by field in declaration order, so sorting by key is
/// deterministic regardless of input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GroupKey {
    pub modality: String,
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub series_number: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.modality, self.patient_id, self.study_uid, self.series_uid, self.series_number
        )
    }
}

/// Whether a file says its series is time-resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameHint {
    /// No temporal information.
    #[default]
    None,

    /// Number of temporal positions (or frames) in the series.
    Frames(u32),

    /// Looks volumetric but encodes time: every member is a time point.
    ForceTime,
}

/// Metadata extracted from one image file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbedSlice {
    pub group_key: GroupKey,
    pub slice_location: Option<f64>,
    pub instance_number: Option<i64>,
    pub frame_hint: FrameHint,
}

impl ProbedSlice {
    pub fn new(group_key: GroupKey) -> Self {
        Self {
            group_key,
            slice_location: None,
            instance_number: None,
            frame_hint: FrameHint::None,
        }
    }

    pub fn with_slice_location(mut self, location: f64) -> Self {
        self.slice_location = Some(location);
        self
    }

    pub fn with_instance_number(mut self, number: i64) -> Self {
        self.instance_number = Some(number);
        self
    }

    pub fn with_frame_hint(mut self, hint: FrameHint) -> Self {
        self.frame_hint = hint;
        self
    }

    /// Slice location when present, otherwise the instance number, otherwise 0.
    ///
    /// A slice location of 0.0 is a real position and still wins over the
    /// instance number; only a missing location falls back.
    pub fn ordering_key(&self) -> f64 {
        self.slice_location
            .or(self.instance_number.map(|n| n as f64))
            .unwrap_or(0.0)
    }
}

/// Extracts grouping metadata from a file.
///
/// Returns `None` for files that are not images (unparseable, or without
/// pixel data); those end up as blobs. Implementations do blocking I/O.
pub trait SeriesProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Option<ProbedSlice>;
}

// =============================================================================
// Assembly Result
// =============================================================================

/// Inferred plane counts of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub z: u32,
    pub t: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesMember {
    pub path: PathBuf,
    pub ordering_key: f64,
}

/// One ordered image stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesGroup {
    pub key: GroupKey,
    pub members: Vec<SeriesMember>,
    pub geometry: Geometry,
}

impl SeriesGroup {
    pub fn files(&self) -> Vec<PathBuf> {
        self.members.iter().map(|m| m.path.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesAssembly {
    pub groups: Vec<SeriesGroup>,
    pub blobs: Vec<PathBuf>,
}

// =============================================================================
// Assembler
// =============================================================================

/// Groups an unordered file set into ordered series.
#[derive(Clone)]
pub struct SeriesAssembler {
    probe: Arc<dyn SeriesProbe>,
}

struct Entry {
    path: PathBuf,
    slice: ProbedSlice,
}

impl SeriesAssembler {
    pub fn new(probe: Arc<dyn SeriesProbe>) -> Self {
        Self { probe }
    }

    /// Probe, group and order `files`.
    ///
    /// Entries are sorted by group key, partitioned into groups, and each
    /// group is sorted by ordering key. Both sorts are stable: entries with
    /// equal keys keep their input order.
    pub fn assemble(&self, files: &[PathBuf]) -> SeriesAssembly {
        let mut entries = Vec::with_capacity(files.len());
        let mut blobs = Vec::new();

        for path in files {
            match self.probe.probe(path) {
                Some(slice) => {
                    debug!(
                        path = %path.display(),
                        key = %slice.group_key,
                        order = slice.ordering_key(),
                        "Probed series member"
                    );
                    entries.push(Entry {
                        path: path.clone(),
                        slice,
                    });
                }
                None => blobs.push(path.clone()),
            }
        }

        entries.sort_by(|a, b| a.slice.group_key.cmp(&b.slice.group_key));

        let mut groups: Vec<Vec<Entry>> = Vec::new();
        for entry in entries {
            let starts_group = groups
                .last()
                .map_or(true, |g| g[0].slice.group_key != entry.slice.group_key);
            if starts_group {
                groups.push(Vec::new());
            }
            if let Some(group) = groups.last_mut() {
                group.push(entry);
            }
        }

        let groups: Vec<SeriesGroup> = groups.into_iter().map(build_group).collect();

        debug!(
            groups = groups.len(),
            blobs = blobs.len(),
            "Assembled series"
        );
        SeriesAssembly { groups, blobs }
    }
}

fn build_group(mut entries: Vec<Entry>) -> SeriesGroup {
    entries.sort_by(|a, b| compare_keys(a.slice.ordering_key(), b.slice.ordering_key()));

    let geometry = infer_geometry(entries.len(), entries[0].slice.frame_hint);
    let key = entries[0].slice.group_key.clone();
    let members = entries
        .into_iter()
        .map(|e| SeriesMember {
            ordering_key: e.slice.ordering_key(),
            path: e.path,
        })
        .collect();

    SeriesGroup {
        key,
        members,
        geometry,
    }
}

fn compare_keys(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

/// Z/T geometry of a group of `len` files, from the first member's hint.
fn infer_geometry(len: usize, hint: FrameHint) -> Geometry {
    let len = len as u32;
    if len <= 1 {
        return Geometry { z: 1, t: 1 };
    }
    match hint {
        FrameHint::Frames(t) if t > 0 => Geometry {
            z: (len / t).max(1),
            t,
        },
        FrameHint::ForceTime => Geometry { z: 1, t: len },
        _ => Geometry { z: len, t: 1 },
    }
}
