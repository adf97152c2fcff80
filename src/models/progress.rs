//! Progress derived from session state.

use serde::{Deserialize, Serialize};

use super::session::UploadSession;

/// Human-facing progress snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Progress {
    /// Whole percent in `[0, 100]`.
    pub percent: u8,
    /// Bytes credited by acked chunks.
    pub uploaded_bytes: u64,
    /// Size of the file.
    pub total_bytes: u64,
}

/// Compute progress for `session`. Pure; valid in any session state.
///
/// An empty file reports 100 percent immediately.
#[must_use]
pub fn progress(session: &UploadSession) -> Progress {
    let uploaded_bytes = session.uploaded_bytes();
    let total_bytes = session.total_bytes();
    let percent = if total_bytes == 0 {
        100
    } else {
        let scaled = u128::from(uploaded_bytes) * 100 / u128::from(total_bytes);
        u8::try_from(scaled.min(100)).unwrap_or(100)
    };
    Progress {
        percent,
        uploaded_bytes,
        total_bytes,
    }
}
