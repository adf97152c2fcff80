//! Unit tests for the receiver's per-upload lock table.

use std::time::Duration;

use pincerna_uploader::receiver::locks::UploadLocks;

const SHORT: Duration = Duration::from_millis(50);

#[tokio::test]
async fn exclusive_lock_blocks_only_its_own_upload() {
    let locks = UploadLocks::new();
    let assembling = locks.acquire("a");
    let _exclusive = assembling.exclusive().await;

    let other = locks.acquire("b");
    tokio::time::timeout(SHORT, other.shared())
        .await
        .expect("other upload is not blocked");

    let same = locks.acquire("a");
    assert!(tokio::time::timeout(SHORT, same.shared()).await.is_err());
}

#[tokio::test]
async fn chunks_of_one_upload_share_the_gate() {
    let locks = UploadLocks::new();
    let first = locks.acquire("a");
    let second = locks.acquire("a");
    let _one = first.shared().await;

    tokio::time::timeout(SHORT, second.shared())
        .await
        .expect("shared access is concurrent");
    assert!(tokio::time::timeout(SHORT, second.exclusive()).await.is_err());
}

#[tokio::test]
async fn entries_are_released_with_the_last_handle() {
    let locks = UploadLocks::new();
    {
        let first = locks.acquire("a");
        let second = locks.acquire("a");
        let _third = locks.acquire("b");
        assert_eq!(locks.len(), 2);

        drop(first);
        assert_eq!(locks.len(), 2);
        let _guard = second.exclusive().await;
    }
    assert!(locks.is_empty());
}
