//! Unit tests for chunk sources.

use pincerna_uploader::models::chunk::{ChunkDescriptor, ChunkSlicer};
use pincerna_uploader::source::{ChunkSource, FileSource, MemorySource};
use pincerna_uploader::AppError;

#[tokio::test]
async fn memory_source_reads_descriptor_ranges() {
    let source = MemorySource::new(b"0123456789".to_vec());
    let slicer = ChunkSlicer::new("s", source.len(), 4).expect("slicer");

    let mut joined = Vec::new();
    for descriptor in &slicer {
        joined.extend_from_slice(&source.read(&descriptor).await.expect("read"));
    }
    assert_eq!(joined, b"0123456789");
}

#[tokio::test]
async fn file_source_reads_descriptor_ranges() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("data.bin");
    std::fs::write(&path, b"abcdefghij").expect("write");

    let source = FileSource::open(&path).await.expect("open");
    assert_eq!(source.len(), 10);
    let last = ChunkSlicer::new("s", 10, 4)
        .expect("slicer")
        .descriptor(2)
        .expect("last");
    assert_eq!(&source.read(&last).await.expect("read")[..], b"ij");
}

#[tokio::test]
async fn out_of_range_read_is_io_error() {
    let source = MemorySource::new(b"abc".to_vec());
    let descriptor = ChunkSlicer::new("s", 8, 8)
        .expect("slicer")
        .descriptor(0)
        .expect("descriptor");
    let err = source.read(&descriptor).await.expect_err("short source");
    assert!(matches!(err, AppError::Io(_)));
}

#[tokio::test]
async fn directories_are_not_sources() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert!(FileSource::open(temp.path()).await.is_err());
    assert!(FileSource::open(temp.path().join("missing")).await.is_err());
}

#[tokio::test]
async fn inverted_range_is_rejected_by_file_source() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("data.bin");
    std::fs::write(&path, b"abcdefghij").expect("write");
    let source = FileSource::open(&path).await.expect("open");
    let descriptor = ChunkDescriptor {
        session_id: "s".into(),
        index: 0,
        byte_start: 6,
        byte_end: 2,
        is_last: false,
    };

    assert_eq!(descriptor.len(), 0);
    assert!(descriptor.is_empty());
    let err = source.read(&descriptor).await.expect_err("inverted");
    assert!(matches!(err, AppError::Io(_)));
}

#[tokio::test]
async fn file_source_rejects_range_past_end() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("data.bin");
    std::fs::write(&path, b"abc").expect("write");
    let source = FileSource::open(&path).await.expect("open");
    let descriptor = ChunkSlicer::new("s", 8, 8)
        .expect("slicer")
        .descriptor(0)
        .expect("descriptor");

    let err = source.read(&descriptor).await.expect_err("past end");
    assert!(matches!(err, AppError::Io(_)));
}
