//! Series assembly tests over file sets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bioimage_engine::convert::ConversionToken;
use bioimage_engine::series::{FrameHint, Geometry, GroupKey, ProbedSlice, SeriesAssembler};

use super::test_utils::{converter, write_file, MapProbe, MockBackend};

fn key(series_uid: &str) -> GroupKey {
    GroupKey {
        modality: "MR".to_string(),
        patient_id: "P1".to_string(),
        study_uid: "1.2.3".to_string(),
        series_uid: series_uid.to_string(),
        series_number: "1".to_string(),
    }
}

/// Two interleaved series plus one unreadable file.
fn mixed_probe() -> (Vec<PathBuf>, MapProbe) {
    let mut map = HashMap::new();
    let mut files = Vec::new();
    for i in 0..5 {
        let path = PathBuf::from(format!("/scan/a{}.dcm", i));
        map.insert(
            path.clone(),
            ProbedSlice::new(key("1.2.3.1")).with_slice_location(10.0 - i as f64 * 2.5),
        );
        files.push(path);

        let path = PathBuf::from(format!("/scan/b{}.dcm", i));
        map.insert(
            path.clone(),
            ProbedSlice::new(key("1.2.3.2")).with_instance_number(5 - i),
        );
        files.push(path);
    }
    files.push(PathBuf::from("/scan/notes.txt"));
    (files, MapProbe(map))
}

#[test]
fn test_assembly_is_independent_of_input_order() {
    let (files, probe) = mixed_probe();
    let assembler = SeriesAssembler::new(Arc::new(probe));

    let forward = assembler.assemble(&files);

    let mut reversed = files.clone();
    reversed.reverse();
    let backward = assembler.assemble(&reversed);

    let mut rotated = files.clone();
    rotated.rotate_left(3);
    let rotated = assembler.assemble(&rotated);

    assert_eq!(forward, backward);
    assert_eq!(forward, rotated);

    assert_eq!(forward.groups.len(), 2);
    assert_eq!(forward.blobs, vec![PathBuf::from("/scan/notes.txt")]);

    let a = &forward.groups[0];
    assert_eq!(a.key.series_uid, "1.2.3.1");
    assert_eq!(a.files()[0], PathBuf::from("/scan/a4.dcm"));
    assert_eq!(a.files()[4], PathBuf::from("/scan/a0.dcm"));
    assert_eq!(a.geometry, Geometry { z: 5, t: 1 });

    let b = &forward.groups[1];
    assert_eq!(b.files()[0], PathBuf::from("/scan/b4.dcm"));
}

#[test]
fn test_frames_hint_splits_z_and_t() {
    let mut map = HashMap::new();
    let mut files = Vec::new();
    for i in 0..10 {
        let path = PathBuf::from(format!("/cine/{}.dcm", i));
        map.insert(
            path.clone(),
            ProbedSlice::new(key("9.9"))
                .with_instance_number(i)
                .with_frame_hint(FrameHint::Frames(5)),
        );
        files.push(path);
    }

    let assembly = SeriesAssembler::new(Arc::new(MapProbe(map))).assemble(&files);
    assert_eq!(assembly.groups.len(), 1);
    assert_eq!(assembly.groups[0].geometry, Geometry { z: 2, t: 5 });

    let token = ConversionToken::from(&assembly.groups[0]);
    assert!(token.is_multifile_series());
    assert_eq!(token.inputs().len(), 10);
    assert_eq!((token.dims().z, token.dims().t), (2, 5));
}

#[tokio::test]
async fn test_non_dicom_files_are_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let text = write_file(dir.path(), "readme.txt", 32);
    let dicomdir = write_file(dir.path(), "DICOMDIR", 32);
    let missing = dir.path().join("missing.dcm");

    let engine = converter(Arc::new(MockBackend::new()));
    let assembly = engine
        .group_files(vec![text.clone(), dicomdir.clone(), missing.clone()])
        .await
        .unwrap();

    assert!(assembly.groups.is_empty());
    assert_eq!(assembly.blobs.len(), 3);
    assert!(assembly.blobs.contains(&dicomdir));
}

#[tokio::test]
async fn test_group_files_with_custom_probe() {
    let (files, probe) = mixed_probe();
    let engine = converter(Arc::new(MockBackend::new()))
        .with_assembler(SeriesAssembler::new(Arc::new(probe)));

    let assembly = engine.group_files(files).await.unwrap();
    assert_eq!(assembly.groups.len(), 2);
    assert_eq!(assembly.blobs.len(), 1);
}
