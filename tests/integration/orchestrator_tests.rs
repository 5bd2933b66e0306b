//! End-to-end orchestrator tests against the scripted converter.

use std::sync::Arc;
use std::time::Duration;

use bioimage_engine::convert::{
    Capabilities, ConversionOutput, ConversionRequest, ConversionToken, Converter,
    ConverterSettings, MetaValue, Operation, OutputPolicy, SeriesMeta,
};
use bioimage_engine::error::{ConvertError, GuardError};
use bioimage_engine::lock::{LockRegistry, ResourceKey};

use super::test_utils::{
    converter, converter_with, fast_settings, installed_capabilities, write_file, MockBackend,
};

fn thumbnail_request(output: &std::path::Path) -> ConversionRequest {
    ConversionRequest::new(Operation::parse("thumbnail", &[]).unwrap()).with_output(output)
}

// =============================================================================
// Successful Runs
// =============================================================================

#[tokio::test]
async fn test_thumbnail_writes_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new());
    let engine = converter(backend.clone());

    let result = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap();

    assert_eq!(result, ConversionOutput::File(output.clone()));
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 1024);
    assert_eq!(backend.call_count(), 1);

    let args = &backend.invocations()[0];
    assert!(args.contains(&"-resize".to_string()));
    assert!(args.contains(&"128,128,BC,AR".to_string()));
}

#[tokio::test]
async fn test_transient_error_is_retried_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_codes(&[100, 0]));
    let engine = converter(backend.clone());

    let result = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await;

    assert!(matches!(result, Ok(ConversionOutput::File(_))));
    assert_eq!(backend.call_count(), 2);
    assert!(output.exists());
}

#[tokio::test]
async fn test_skip_if_exists_reuses_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = write_file(dir.path(), "thumb.jpg", 100);

    let backend = Arc::new(MockBackend::new());
    let engine = converter(backend.clone());
    let request = thumbnail_request(&output).with_policy(OutputPolicy::SkipIfExists);

    let result = engine
        .execute(&ConversionToken::single(&input), &request)
        .await
        .unwrap();

    assert_eq!(result, ConversionOutput::File(output.clone()));
    assert_eq!(backend.call_count(), 0);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 100);
}

#[tokio::test]
async fn test_overwrite_replaces_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = write_file(dir.path(), "thumb.jpg", 100);

    let backend = Arc::new(MockBackend::new().with_payload(2048));
    let engine = converter(backend.clone());
    let request = thumbnail_request(&output).with_policy(OutputPolicy::Overwrite);

    engine
        .execute(&ConversionToken::single(&input), &request)
        .await
        .unwrap();

    assert_eq!(backend.call_count(), 1);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 2048);
}

#[tokio::test]
async fn test_multifile_convert_uses_file_list() {
    let dir = tempfile::tempdir().unwrap();
    let files: Vec<_> = (0..4)
        .map(|i| write_file(dir.path(), &format!("plane{}.dcm", i), 64))
        .collect();
    let output = dir.path().join("stack.ome.tif");

    let backend = Arc::new(MockBackend::new());
    let engine = converter(backend.clone());
    let token = ConversionToken::multifile(files, SeriesMeta::new(2, 2, 0));
    let request = ConversionRequest::new(Operation::parse("convert", &[]).unwrap())
        .with_output(&output);

    engine.execute(&token, &request).await.unwrap();

    let args = &backend.invocations()[0];
    let list = dir.path().join("stack.ome.tif.files");
    let il = args.iter().position(|a| a == "-il").unwrap();
    assert_eq!(args[il + 1], list.to_string_lossy());
    let geometry = args.iter().position(|a| a == "-geometry").unwrap();
    assert_eq!(args[geometry + 1], "2,2");

    // The list only lives for the duration of the run
    assert!(!list.exists());
    assert!(output.exists());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_persistent_transient_error_escalates() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_codes(&[100, 101]));
    let engine = converter(backend.clone());

    let err = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap_err();

    assert_eq!(err, ConvertError::TransientLibrary { code: 101 });
    assert_eq!(backend.call_count(), 2);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_timeout_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_codes(&[99]));
    let engine = converter(backend.clone());

    let err = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap_err();

    assert!(matches!(err, ConvertError::Timeout { .. }));
    assert!(!err.is_retry_later());
    assert_eq!(backend.call_count(), 1);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_converter_failure_reports_code() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_default_code(2));
    let engine = converter(backend.clone());

    let err = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap_err();

    assert!(matches!(err, ConvertError::ConverterFailed { code: 2, .. }));
    assert_eq!(backend.call_count(), 1);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_small_output_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_payload(5));
    let engine = converter(backend.clone());

    let err = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ConvertError::CorruptOutput {
            path: output.clone(),
            size: 5,
            minimum: 10,
        }
    );
    assert!(!output.exists());
}

#[tokio::test]
async fn test_small_output_is_removed_before_next_writer_gets_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let registry = Arc::new(LockRegistry::new());
    let backend = Arc::new(
        MockBackend::new()
            .with_payload(5)
            .with_delay(Duration::from_millis(50)),
    );
    let engine = Converter::new(
        backend.clone(),
        Arc::new(installed_capabilities()),
        registry.clone(),
        fast_settings(),
    );

    let token = ConversionToken::single(&input);
    let request = thumbnail_request(&output);

    // A second writer queues on the output while the first conversion runs
    let next_writer = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let handle = registry
            .acquire_write(&ResourceKey::new(&output), None)
            .await
            .unwrap();
        let leftover = output.exists();
        std::fs::write(&output, vec![b'y'; 1024]).unwrap();
        handle.release();
        leftover
    };

    let (result, leftover) = tokio::join!(engine.execute(&token, &request), next_writer);

    assert!(matches!(
        result,
        Err(ConvertError::CorruptOutput { size: 5, .. })
    ));
    assert!(!leftover);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 1024);
}

#[tokio::test]
async fn test_not_installed_converter_is_configuration_missing() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new());
    let engine = Converter::new(
        backend.clone(),
        Arc::new(Capabilities::not_installed("imgcnv")),
        Arc::new(LockRegistry::new()),
        fast_settings(),
    );

    let err = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::ConfigurationMissing { .. }));

    let err = engine
        .meta(&ConversionToken::single(&input))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::ConfigurationMissing { .. }));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_missing_input_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new());
    let engine = converter(backend.clone());

    let err = engine
        .execute(
            &ConversionToken::single(dir.path().join("missing.tif")),
            &thumbnail_request(&output),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ConvertError::Io { .. }));
    assert_eq!(backend.call_count(), 0);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_concurrent_identical_requests_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_delay(Duration::from_millis(100)));
    let engine = Arc::new(converter(backend.clone()));
    let token = ConversionToken::single(&input);
    let request = thumbnail_request(&output);

    let (a, b) = tokio::join!(
        engine.execute(&token, &request),
        engine.execute(&token, &request)
    );

    let results = [a, b];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_retry_later()))
        .count();

    assert_eq!(succeeded, 1);
    assert_eq!(busy, 1);
    assert_eq!(backend.call_count(), 1);
    assert!(!backend.overlapped());
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 1024);
}

#[tokio::test]
async fn test_existing_output_is_busy_and_kept() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = write_file(dir.path(), "thumb.jpg", 100);

    let backend = Arc::new(MockBackend::new());
    let engine = converter(backend.clone());

    let err = engine
        .execute(&ConversionToken::single(&input), &thumbnail_request(&output))
        .await
        .unwrap_err();

    assert!(err.is_retry_later());
    assert!(matches!(
        err,
        ConvertError::Busy {
            reason: GuardError::OutputExists(_)
        }
    ));
    assert_eq!(backend.call_count(), 0);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 100);
}

#[tokio::test]
async fn test_overwriting_writers_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 256);
    let output = dir.path().join("thumb.jpg");

    let backend = Arc::new(MockBackend::new().with_delay(Duration::from_millis(30)));
    let engine = converter(backend.clone());
    let token = ConversionToken::single(&input);
    let request = thumbnail_request(&output).with_policy(OutputPolicy::Overwrite);

    let (a, b, c) = tokio::join!(
        engine.execute(&token, &request),
        engine.execute(&token, &request),
        engine.execute(&token, &request)
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(backend.call_count(), 3);
    assert!(!backend.overlapped());
}

// =============================================================================
// Read Queries
// =============================================================================

#[tokio::test]
async fn test_meta_applies_series_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let files: Vec<_> = (0..6)
        .map(|i| write_file(dir.path(), &format!("{}.dcm", i), 64))
        .collect();

    let listing = "image_num_x: 512\nimage_num_y: 512\nimage_num_z: 1\n\
                   image_num_t: 1\nimage_num_c: 1\nformat: DICOM";
    let backend = Arc::new(MockBackend::new().with_stdout(listing));
    let engine = converter(backend.clone());
    let token = ConversionToken::multifile(files, SeriesMeta::new(3, 2, 0));

    let meta = engine.meta(&token).await.unwrap();
    assert_eq!(meta["image_num_z"], MetaValue::Int(3));
    assert_eq!(meta["image_num_t"], MetaValue::Int(2));
    assert_eq!(meta["image_num_x"], MetaValue::Int(512));

    let dims = engine.info(&token).await.unwrap();
    assert_eq!((dims.width, dims.z, dims.t), (512, 3, 2));

    let args = &backend.invocations()[0];
    assert_eq!(args[0], "-meta");
}

#[tokio::test]
async fn test_supported_query() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 64);
    let token = ConversionToken::single(&input);

    let yes = converter(Arc::new(MockBackend::new().with_stdout("yes: TIFF")));
    assert!(yes.supported(&token).await.unwrap());

    let no = converter(Arc::new(MockBackend::new().with_stdout("no")));
    assert!(!no.supported(&token).await.unwrap());

    let request = ConversionRequest::new(Operation::Supported);
    assert_eq!(
        yes.execute(&token, &request).await.unwrap(),
        ConversionOutput::Supported(true)
    );
}

#[tokio::test]
async fn test_non_blocking_read_of_busy_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 64);

    let registry = Arc::new(LockRegistry::new());
    let backend = Arc::new(MockBackend::new().with_stdout("image_num_x: 10"));
    let engine = Converter::new(
        backend.clone(),
        Arc::new(super::test_utils::installed_capabilities()),
        registry.clone(),
        ConverterSettings {
            block_reads: false,
            ..fast_settings()
        },
    );

    let writer = registry
        .acquire_write(&ResourceKey::new(&input), None)
        .await
        .unwrap();

    let err = engine
        .meta(&ConversionToken::single(&input))
        .await
        .unwrap_err();
    assert!(err.is_retry_later());
    assert_eq!(backend.call_count(), 0);

    writer.release();
    assert!(engine.meta(&ConversionToken::single(&input)).await.is_ok());
}

#[tokio::test]
async fn test_invalid_request_rejected_before_locking() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "in.tif", 64);

    let backend = Arc::new(MockBackend::new());
    let engine = converter_with(backend.clone(), ConverterSettings::default());

    // Thumbnails need an output path
    let request = ConversionRequest::new(Operation::parse("thumbnail", &[]).unwrap());
    let err = engine
        .execute(&ConversionToken::single(&input), &request)
        .await
        .unwrap_err();

    assert!(matches!(err, ConvertError::InvalidRequest { .. }));
    assert_eq!(backend.call_count(), 0);
}
