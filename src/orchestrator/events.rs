//! Events emitted while an upload runs.
//!
//! Observers receive these over a `tokio::sync::mpsc` unbounded channel so
//! the scheduler never waits on a slow consumer.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::models::progress::Progress;
use crate::transport::FinalizeReceipt;

/// Sender half handed to the coordinator and scheduler.
pub type EventSender = mpsc::UnboundedSender<UploadEvent>;

/// Progress and lifecycle notifications for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// A chunk was acknowledged by the remote.
    ChunkAcked {
        /// Owning session.
        session_id: String,
        /// Acked chunk index.
        index: usize,
        /// Progress after applying the ack.
        progress: Progress,
    },
    /// A chunk failed and will be resent after `delay`.
    ChunkRetrying {
        /// Owning session.
        session_id: String,
        /// Failed chunk index.
        index: usize,
        /// Consecutive failures so far (1-based).
        attempt: u32,
        /// Backoff before the resend.
        delay: Duration,
        /// Rendered transport error.
        error: String,
    },
    /// Every chunk is acked and the finalize request is being issued.
    Finalizing {
        /// Owning session.
        session_id: String,
    },
    /// The remote assembled the file.
    Completed {
        /// Owning session.
        session_id: String,
        /// Remote confirmation.
        receipt: FinalizeReceipt,
    },
    /// The session failed terminally.
    Failed {
        /// Owning session.
        session_id: String,
        /// Rendered terminal error.
        error: String,
    },
    /// The session was cancelled.
    Cancelled {
        /// Owning session.
        session_id: String,
    },
}

/// Deliver `event` if anyone is listening. A dropped receiver is ignored.
pub(crate) fn emit(events: Option<&EventSender>, event: UploadEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
