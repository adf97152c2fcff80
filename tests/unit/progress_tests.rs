//! Unit tests for progress reporting.

use pincerna_uploader::models::progress::progress;
use pincerna_uploader::models::session::UploadSession;

#[test]
fn fresh_session_reports_zero() {
    let s = UploadSession::create("f", 10, "/", 4).expect("session");
    let p = progress(&s);
    assert_eq!(p.percent, 0);
    assert_eq!(p.uploaded_bytes, 0);
    assert_eq!(p.total_bytes, 10);
}

#[test]
fn empty_file_reports_complete() {
    let s = UploadSession::create("f", 0, "/", 4).expect("session");
    assert_eq!(progress(&s).percent, 100);
}

#[test]
fn percent_is_floored_and_monotonic() {
    let mut s = UploadSession::create("f", 10, "/", 4).expect("session");
    let mut seen = vec![progress(&s).percent];
    for (i, len) in [(1, 4), (0, 4), (2, 2)] {
        s.mark_in_flight(i).expect("in flight");
        s.mark_acked(i, len).expect("acked");
        seen.push(progress(&s).percent);
    }
    assert_eq!(seen, vec![0, 40, 80, 100]);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn large_files_do_not_overflow() {
    let total = u64::MAX / 2;
    let mut s = UploadSession::create("f", total, "/", total / 2 + 1).expect("session");
    s.mark_in_flight(0).expect("in flight");
    s.mark_acked(0, total / 2 + 1).expect("acked");
    assert_eq!(progress(&s).percent, 50);
}
