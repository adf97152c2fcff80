//! End-to-end uploads through `HttpTransport` into the receiver.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pincerna_uploader::orchestrator::events::UploadEvent;
use pincerna_uploader::source::{FileSource, MemorySource};

use super::test_helpers::{patterned, sha256_hex, spawn_receiver};

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn ten_mib_upload_assembles_identical_file() {
    let receiver = spawn_receiver(None).await;
    let data = patterned(10 * MIB);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = receiver
        .coordinator(None, 4 * MIB as u64)
        .upload(
            Arc::new(MemorySource::new(data.clone())),
            "data.bin",
            "/docs",
            &CancellationToken::new(),
            Some(&tx),
        )
        .await
        .expect("upload");
    drop(tx);

    assert_eq!(report.total_chunks, 3);
    assert!(report.receipt.success);
    assert_eq!(report.receipt.path.as_deref(), Some("/docs/data.bin"));
    assert_eq!(report.receipt.size, Some(10 * MIB as u64));
    assert_eq!(report.receipt.sha256.as_deref(), Some(sha256_hex(&data).as_str()));

    let stored = std::fs::read(receiver.storage_root().join("docs/data.bin")).expect("stored");
    assert_eq!(stored, data);
    assert!(
        !receiver.storage_root().join(".staging").join(&report.session_id).exists(),
        "staging removed after assembly"
    );

    let mut percents = Vec::new();
    while let Some(event) = rx.recv().await {
        if let UploadEvent::ChunkAcked { progress, .. } = event {
            percents.push(progress.percent);
        }
    }
    assert_eq!(percents.len(), 3);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));
}

#[tokio::test]
async fn file_source_upload_round_trips() {
    let receiver = spawn_receiver(None).await;
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("notes.txt");
    let data = patterned(50_000);
    std::fs::write(&path, &data).expect("write source");

    let source = Arc::new(FileSource::open(&path).await.expect("open"));
    let report = receiver
        .coordinator(None, 8 * 1024)
        .upload(source, "notes.txt", "/", &CancellationToken::new(), None)
        .await
        .expect("upload");

    assert_eq!(report.total_chunks, 7);
    assert_eq!(report.receipt.path.as_deref(), Some("/notes.txt"));
    let stored = std::fs::read(receiver.storage_root().join("notes.txt")).expect("stored");
    assert_eq!(stored, data);
}

#[tokio::test]
async fn empty_file_creates_empty_artifact() {
    let receiver = spawn_receiver(None).await;

    let report = receiver
        .coordinator(None, 1024)
        .upload(
            Arc::new(MemorySource::new(Vec::<u8>::new())),
            "empty.txt",
            "/inbox",
            &CancellationToken::new(),
            None,
        )
        .await
        .expect("upload");

    assert_eq!(report.total_chunks, 0);
    assert_eq!(report.receipt.size, Some(0));
    let stored = receiver.storage_root().join("inbox/empty.txt");
    assert!(stored.is_file());
    assert_eq!(std::fs::metadata(stored).expect("metadata").len(), 0);
}

#[tokio::test]
async fn concurrent_sessions_do_not_interfere() {
    let receiver = spawn_receiver(None).await;
    let first = patterned(30_000);
    let second: Vec<u8> = patterned(20_000).into_iter().rev().collect();
    let coordinator = receiver.coordinator(None, 4096);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        coordinator.upload(
            Arc::new(MemorySource::new(first.clone())),
            "a.bin",
            "/",
            &cancel,
            None,
        ),
        coordinator.upload(
            Arc::new(MemorySource::new(second.clone())),
            "b.bin",
            "/",
            &cancel,
            None,
        ),
    );

    assert_ne!(a.expect("a").session_id, b.expect("b").session_id);
    assert_eq!(std::fs::read(receiver.storage_root().join("a.bin")).expect("a"), first);
    assert_eq!(std::fs::read(receiver.storage_root().join("b.bin")).expect("b"), second);
}
