//! DICOM header probe.

use std::path::Path;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::file::ReadPreamble;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use tracing::debug;

use super::assembler::{FrameHint, GroupKey, ProbedSlice, SeriesProbe};

/// File name of DICOM directory indexes, which never carry pixel data.
const DICOMDIR: &str = "DICOMDIR";

/// Reads grouping metadata from DICOM headers.
///
/// Files are opened with or without the 128-byte preamble. Unreadable files,
/// `DICOMDIR` indexes and datasets without pixel data are reported as blobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomProbe;

impl DicomProbe {
    pub fn new() -> Self {
        Self
    }
}

impl SeriesProbe for DicomProbe {
    fn probe(&self, path: &Path) -> Option<ProbedSlice> {
        if path.file_name().is_some_and(|name| name == DICOMDIR) {
            return None;
        }

        let obj = match OpenFileOptions::new()
            .read_preamble(ReadPreamble::Auto)
            .open_file(path)
        {
            Ok(obj) => obj,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Not a DICOM file");
                return None;
            }
        };

        if obj.element(tags::PIXEL_DATA).is_err() {
            debug!(path = %path.display(), "DICOM file without pixel data");
            return None;
        }

        Some(slice_from_dataset(&obj))
    }
}

fn slice_from_dataset(obj: &InMemDicomObject) -> ProbedSlice {
    let group_key = GroupKey {
        modality: text(obj, tags::MODALITY).unwrap_or_default(),
        patient_id: text(obj, tags::PATIENT_ID).unwrap_or_default(),
        study_uid: text(obj, tags::STUDY_INSTANCE_UID).unwrap_or_default(),
        series_uid: text(obj, tags::SERIES_INSTANCE_UID).unwrap_or_default(),
        series_number: text(obj, tags::SERIES_NUMBER).unwrap_or_default(),
    };

    let slice_location = number::<f64>(obj, tags::SLICE_LOCATION);
    let has_slice_location = obj.element(tags::SLICE_LOCATION).is_ok();

    let temporal_positions = number::<u32>(obj, tags::NUMBER_OF_TEMPORAL_POSITIONS).unwrap_or(0);
    let frames = number::<u32>(obj, tags::NUMBER_OF_FRAMES).unwrap_or(0);
    let acquisition_3d = text(obj, tags::MR_ACQUISITION_TYPE).as_deref() == Some("3D");

    // A 3D acquisition without slice locations is a time series of volumes.
    let frame_hint = if temporal_positions > 0 {
        FrameHint::Frames(temporal_positions)
    } else if frames > 0 {
        FrameHint::Frames(frames)
    } else if acquisition_3d && !has_slice_location {
        FrameHint::ForceTime
    } else {
        FrameHint::None
    };

    ProbedSlice {
        group_key,
        slice_location,
        instance_number: number::<i64>(obj, tags::INSTANCE_NUMBER),
        frame_hint,
    }
}

fn text(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let element = obj.element(tag).ok()?;
    let value = element.to_str().ok()?;
    Some(value.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
}

fn number<T: std::str::FromStr>(obj: &InMemDicomObject, tag: Tag) -> Option<T> {
    text(obj, tag)?.parse().ok()
}
