//! Receiver contract tests: dedup, idempotent finalize, missing parts,
//! path validation, staging sweep.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use pincerna_uploader::models::session::UploadSession;
use pincerna_uploader::receiver::SweepReport;
use pincerna_uploader::source::MemorySource;
use pincerna_uploader::transport::ChunkTransport;
use pincerna_uploader::AppError;

use super::test_helpers::{patterned, sha256_hex, spawn_receiver, API_PREFIX};

/// Send every chunk of `data` for `session` once.
async fn send_all(transport: &dyn ChunkTransport, session: &UploadSession, data: &Bytes) {
    let target = session.target();
    for descriptor in &session.slicer().expect("slicer") {
        let range = usize::try_from(descriptor.byte_start).expect("start")
            ..usize::try_from(descriptor.byte_end).expect("end");
        transport
            .send(&target, &descriptor, data.slice(range))
            .await
            .expect("send");
    }
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let receiver = spawn_receiver(Some("secret")).await;

    let response = reqwest::get(format!("{}{API_PREFIX}/health", receiver.base_url()))
        .await
        .expect("request");

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "ok");
}

#[tokio::test]
async fn resent_chunk_is_stored_once() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let data = Bytes::from(patterned(10));
    let session = UploadSession::create("dup.bin", 10, "/", 4).expect("session");

    send_all(transport.as_ref(), &session, &data).await;
    send_all(transport.as_ref(), &session, &data).await;
    let receipt = transport.finalize(&session.target()).await.expect("finalize");

    assert_eq!(receipt.size, Some(10));
    assert_eq!(
        std::fs::read(receiver.storage_root().join("dup.bin")).expect("stored"),
        data.to_vec()
    );
}

#[tokio::test]
async fn repeated_finalize_returns_same_receipt() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let data = Bytes::from(patterned(9));
    let session = UploadSession::create("twice.bin", 9, "/docs", 4).expect("session");
    send_all(transport.as_ref(), &session, &data).await;

    let target = session.target();
    let (first, second) = tokio::join!(transport.finalize(&target), transport.finalize(&target));
    let first = first.expect("first");
    let second = second.expect("second");
    let third = transport.finalize(&target).await.expect("third");

    assert_eq!(first, second);
    assert_eq!(first, third);
    assert_eq!(first.sha256.as_deref(), Some(sha256_hex(&data).as_str()));
    assert_eq!(
        std::fs::read(receiver.storage_root().join("docs/twice.bin")).expect("stored"),
        data.to_vec()
    );
}

#[tokio::test]
async fn finalize_with_missing_chunks_is_refused() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let session = UploadSession::create("partial.bin", 12, "/", 4).expect("session");
    let target = session.target();
    let first = session.slicer().expect("slicer").descriptor(0).expect("first");
    transport
        .send(&target, &first, Bytes::from_static(b"abcd"))
        .await
        .expect("send");

    let err = transport.finalize(&target).await.expect_err("missing chunks");

    match err {
        AppError::Finalize(msg) => assert!(msg.contains("missing"), "{msg}"),
        other => panic!("expected finalize error, got {other:?}"),
    }
    assert!(!receiver.storage_root().join("partial.bin").exists());
}

#[tokio::test]
async fn finalize_of_unknown_upload_is_refused() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let session = UploadSession::create("ghost.bin", 4, "/", 4).expect("session");

    let err = transport
        .finalize(&session.target())
        .await
        .expect_err("nothing staged");
    assert!(matches!(err, AppError::Finalize(_)));
}

#[tokio::test]
async fn traversal_destination_is_rejected_without_retry() {
    let receiver = spawn_receiver(None).await;

    let err = receiver
        .coordinator(None, 4)
        .upload(
            Arc::new(MemorySource::new(patterned(8))),
            "escape.bin",
            "../outside",
            &CancellationToken::new(),
            None,
        )
        .await
        .expect_err("traversal");

    match err {
        AppError::SessionFailed(msg) => assert!(msg.contains("path violation"), "{msg}"),
        other => panic!("expected session failure, got {other:?}"),
    }
    let parent = receiver.storage_root().parent().expect("parent");
    assert!(!parent.join("outside").join("escape.bin").exists());
}

#[tokio::test]
async fn chunk_disagreeing_with_manifest_is_rejected() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let session = UploadSession::create("m.bin", 8, "/", 4).expect("session");
    let mut target = session.target();
    let first = session.slicer().expect("slicer").descriptor(0).expect("first");
    transport
        .send(&target, &first, Bytes::from_static(b"abcd"))
        .await
        .expect("send");

    target.total_chunks = 5;
    let err = transport
        .send(&target, &first, Bytes::from_static(b"abcd"))
        .await
        .expect_err("total changed");
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn finalize_receipt_survives_receiver_restart() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let data = Bytes::from(patterned(9));
    let session = UploadSession::create("kept.bin", 9, "/docs", 4).expect("session");
    send_all(transport.as_ref(), &session, &data).await;
    let target = session.target();
    let first = transport.finalize(&target).await.expect("first finalize");

    let restarted = receiver.restart().await;
    let (transport, _, _) = restarted.transport(None);
    let again = transport.finalize(&target).await.expect("finalize after restart");

    assert_eq!(first, again);
    assert_eq!(
        std::fs::read(restarted.storage_root().join("docs/kept.bin")).expect("stored"),
        data.to_vec()
    );

    let descriptor = session.slicer().expect("slicer").descriptor(0).expect("first");
    let err = transport
        .send(&target, &descriptor, data.slice(0..4))
        .await
        .expect_err("upload already finalized");
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn sweep_discards_idle_upload_and_expired_receipt() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let data = Bytes::from(patterned(8));

    let abandoned = UploadSession::create("left.bin", 8, "/", 4).expect("session");
    let abandoned_target = abandoned.target();
    let descriptor = abandoned
        .slicer()
        .expect("slicer")
        .descriptor(0)
        .expect("first");
    transport
        .send(&abandoned_target, &descriptor, data.slice(0..4))
        .await
        .expect("send");

    let finished = UploadSession::create("done.bin", 8, "/", 4).expect("session");
    send_all(transport.as_ref(), &finished, &data).await;
    transport
        .finalize(&finished.target())
        .await
        .expect("finalize");

    let later = SystemTime::now() + Duration::from_secs(60);
    let report = receiver
        .state
        .sweep_before(later, SystemTime::UNIX_EPOCH)
        .await
        .expect("sweep uploads");
    assert_eq!(report.uploads, 1);
    assert_eq!(report.receipts, 0);
    assert!(!receiver
        .storage_root()
        .join(".staging")
        .join(&abandoned_target.upload_id)
        .exists());

    let err = transport
        .finalize(&abandoned_target)
        .await
        .expect_err("parts were discarded");
    assert!(matches!(err, AppError::Finalize(_)));

    let report = receiver
        .state
        .sweep_before(SystemTime::UNIX_EPOCH, later)
        .await
        .expect("sweep receipts");
    assert_eq!(report.receipts, 1);
    assert!(receiver.storage_root().join("done.bin").is_file());
}

#[tokio::test]
async fn sweep_with_default_retention_keeps_recent_work() {
    let receiver = spawn_receiver(None).await;
    let (transport, _, _) = receiver.transport(None);
    let data = Bytes::from(patterned(4));
    let session = UploadSession::create("fresh.bin", 8, "/", 4).expect("session");
    let descriptor = session.slicer().expect("slicer").descriptor(0).expect("first");
    transport
        .send(&session.target(), &descriptor, data)
        .await
        .expect("send");

    let report = receiver.state.sweep().await.expect("sweep");

    assert_eq!(report, SweepReport::default());
    assert!(receiver
        .storage_root()
        .join(".staging")
        .join(session.id())
        .is_dir());
}
