//! Upload session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::chunk::ChunkSlicer;
use crate::{AppError, Result};

/// Lifecycle status for an upload session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Chunks are being dispatched.
    Active,
    /// Every chunk is acked; the finalize request is outstanding.
    Finalizing,
    /// The server assembled the file.
    Completed,
    /// A chunk exhausted its retries or finalize failed.
    Failed,
    /// The caller abandoned the upload.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-chunk transfer status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// Waiting in the work queue.
    Pending,
    /// Handed to the transport.
    InFlight,
    /// Confirmed by the remote.
    Acked,
    /// Last attempt failed; awaiting retry or abort.
    Failed,
}

impl ChunkState {
    /// Determine whether a chunk-level transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Acked | Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

/// Addressing data every chunk and finalize request carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UploadTarget {
    /// Session identifier, sent as `upload_id`.
    pub upload_id: String,
    /// Name of the assembled file.
    pub file_name: String,
    /// Destination directory on the remote.
    pub destination_path: String,
    /// Number of chunks the remote should expect.
    pub total_chunks: usize,
}

/// One logical file upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UploadSession {
    id: String,
    file_name: String,
    total_bytes: u64,
    destination_path: String,
    chunk_size: u64,
    total_chunks: usize,
    chunk_states: Vec<ChunkState>,
    uploaded_bytes: u64,
    status: SessionStatus,
    created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a session in `Active` with every chunk `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if `chunk_size` is zero.
    pub fn create(
        file_name: impl Into<String>,
        total_bytes: u64,
        destination_path: impl Into<String>,
        chunk_size: u64,
    ) -> Result<Self> {
        let id = generate_session_id();
        let total_chunks = ChunkSlicer::new(id.clone(), total_bytes, chunk_size)?.total_chunks();
        Ok(Self {
            id,
            file_name: file_name.into(),
            total_bytes,
            destination_path: destination_path.into(),
            chunk_size,
            total_chunks,
            chunk_states: vec![ChunkState::Pending; total_chunks],
            uploaded_bytes: 0,
            status: SessionStatus::Active,
            created_at: Utc::now(),
        })
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the file being uploaded.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Total size of the file.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Destination directory on the remote.
    #[must_use]
    pub fn destination_path(&self) -> &str {
        &self.destination_path
    }

    /// Fixed chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(total_bytes / chunk_size)`.
    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Aggregate of acked chunk lengths. Progress only.
    #[must_use]
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// State of chunk `index`, or `None` if out of range.
    #[must_use]
    pub fn chunk_state(&self, index: usize) -> Option<ChunkState> {
        self.chunk_states.get(index).copied()
    }

    /// Number of acked chunks.
    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.chunk_states
            .iter()
            .filter(|state| **state == ChunkState::Acked)
            .count()
    }

    /// True iff every chunk is acked. Vacuously true for empty files.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.chunk_states
            .iter()
            .all(|state| *state == ChunkState::Acked)
    }

    /// Slicer producing this session's descriptors.
    ///
    /// # Errors
    ///
    /// Never fails for a session built by [`create`](Self::create); the
    /// signature mirrors [`ChunkSlicer::new`].
    pub fn slicer(&self) -> Result<ChunkSlicer> {
        ChunkSlicer::new(self.id.clone(), self.total_bytes, self.chunk_size)
    }

    /// Addressing data for transport requests.
    #[must_use]
    pub fn target(&self) -> UploadTarget {
        UploadTarget {
            upload_id: self.id.clone(),
            file_name: self.file_name.clone(),
            destination_path: self.destination_path.clone(),
            total_chunks: self.total_chunks,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Active,
                SessionStatus::Finalizing | SessionStatus::Failed | SessionStatus::Cancelled
            ) | (
                SessionStatus::Finalizing,
                SessionStatus::Completed | SessionStatus::Failed
            )
        )
    }

    /// `Pending -> InFlight`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the chunk is not pending or
    /// the session is no longer active.
    pub fn mark_in_flight(&mut self, index: usize) -> Result<()> {
        self.ensure_active(index)?;
        self.transition_chunk(index, ChunkState::InFlight)
    }

    /// `InFlight -> Acked`, crediting `bytes_written` to progress.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the chunk is not in flight or
    /// the session is no longer active.
    pub fn mark_acked(&mut self, index: usize, bytes_written: u64) -> Result<()> {
        self.ensure_active(index)?;
        self.transition_chunk(index, ChunkState::Acked)?;
        self.uploaded_bytes = self.uploaded_bytes.saturating_add(bytes_written);
        Ok(())
    }

    /// `InFlight -> Failed`. The session stays active; the scheduler decides
    /// between retry and abort.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the chunk is not in flight or
    /// the session is no longer active.
    pub fn mark_failed(&mut self, index: usize) -> Result<()> {
        self.ensure_active(index)?;
        self.transition_chunk(index, ChunkState::Failed)
    }

    /// `Failed -> Pending`, returning the chunk to the work queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the chunk has not failed or
    /// the session is no longer active.
    pub fn requeue(&mut self, index: usize) -> Result<()> {
        self.ensure_active(index)?;
        self.transition_chunk(index, ChunkState::Pending)
    }

    /// `Active -> Finalizing`; requires every chunk acked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if a chunk is still outstanding
    /// or the session is not active.
    pub fn begin_finalizing(&mut self) -> Result<()> {
        if !self.all_acked() {
            let acked = self.acked_count();
            return Err(self.reject(format!(
                "cannot finalize with {acked}/{} chunks acked",
                self.total_chunks
            )));
        }
        self.transition_status(SessionStatus::Finalizing)
    }

    /// `Finalizing -> Completed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` unless the session is finalizing.
    pub fn complete(&mut self) -> Result<()> {
        self.transition_status(SessionStatus::Completed)
    }

    /// `Active | Finalizing -> Failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is already terminal.
    pub fn fail(&mut self) -> Result<()> {
        self.transition_status(SessionStatus::Failed)
    }

    /// `Active -> Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is finalizing or
    /// already terminal.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition_status(SessionStatus::Cancelled)
    }

    fn ensure_active(&self, index: usize) -> Result<()> {
        if self.status == SessionStatus::Active {
            Ok(())
        } else {
            Err(self.reject(format!(
                "chunk {index} touched while session is {:?}",
                self.status
            )))
        }
    }

    fn transition_chunk(&mut self, index: usize, next: ChunkState) -> Result<()> {
        let Some(current) = self.chunk_states.get(index).copied() else {
            return Err(self.reject(format!(
                "chunk {index} out of range for {} chunks",
                self.total_chunks
            )));
        };
        if !current.can_transition_to(next) {
            return Err(self.reject(format!("chunk {index}: {current:?} -> {next:?}")));
        }
        self.chunk_states[index] = next;
        Ok(())
    }

    fn transition_status(&mut self, next: SessionStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(self.reject(format!("session: {:?} -> {next:?}", self.status)));
        }
        self.status = next;
        Ok(())
    }

    fn reject(&self, detail: String) -> AppError {
        error!(session_id = %self.id, %detail, "rejected upload state transition");
        AppError::InvalidTransition(detail)
    }
}

/// Millisecond timestamp plus a random suffix, unique across concurrent
/// sessions from the same client.
fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}
