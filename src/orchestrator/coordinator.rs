//! End-to-end upload: session creation, chunk scheduling, finalize.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::events::{emit, EventSender, UploadEvent};
use super::finalize::FinalizeCoordinator;
use super::scheduler::{ConcurrencyScheduler, RunOutcome, SchedulerOptions};
use crate::config::GlobalConfig;
use crate::models::session::UploadSession;
use crate::source::ChunkSource;
use crate::transport::{ChunkTransport, FinalizeReceipt};
use crate::{AppError, Result};

/// Summary returned for a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Session that carried the upload.
    pub session_id: String,
    /// Size of the uploaded file.
    pub total_bytes: u64,
    /// Chunks sent.
    pub total_chunks: usize,
    /// Remote confirmation.
    pub receipt: FinalizeReceipt,
}

/// Owns the transport and policies shared by every upload it runs.
pub struct UploadCoordinator {
    transport: Arc<dyn ChunkTransport>,
    scheduler: ConcurrencyScheduler,
    finalizer: FinalizeCoordinator,
    chunk_size: u64,
}

impl UploadCoordinator {
    /// Assemble a coordinator from its parts.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        scheduler: ConcurrencyScheduler,
        finalizer: FinalizeCoordinator,
        chunk_size: u64,
    ) -> Self {
        Self {
            transport,
            scheduler,
            finalizer,
            chunk_size,
        }
    }

    /// Coordinator configured from `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig, transport: Arc<dyn ChunkTransport>) -> Self {
        Self::new(
            transport,
            ConcurrencyScheduler::new(SchedulerOptions::from(&config.upload)),
            FinalizeCoordinator::from(&config.finalize),
            config.upload.chunk_size_bytes,
        )
    }

    /// Create a session sized for `source`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if the configured chunk size is zero.
    pub fn create_session(
        &self,
        source: &dyn ChunkSource,
        file_name: &str,
        destination_path: &str,
    ) -> Result<UploadSession> {
        UploadSession::create(file_name, source.len(), destination_path, self.chunk_size)
    }

    /// Upload `source` as `file_name` under `destination_path`.
    ///
    /// # Errors
    ///
    /// See [`run_session`](Self::run_session).
    pub async fn upload(
        &self,
        source: Arc<dyn ChunkSource>,
        file_name: &str,
        destination_path: &str,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<UploadReport> {
        let mut session = self.create_session(source.as_ref(), file_name, destination_path)?;
        self.run_session(&mut session, source, cancel, events).await
    }

    /// Drive an already created session to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionFailed` when a chunk exhausts its retries,
    /// `AppError::Cancelled` when `cancel` fires first, the finalize error
    /// when assembly fails, and `AppError::InvalidTransition` for state
    /// machine misuse.
    pub async fn run_session(
        &self,
        session: &mut UploadSession,
        source: Arc<dyn ChunkSource>,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<UploadReport> {
        let span = info_span!("upload", session_id = %session.id());
        let result = self
            .drive(session, source, cancel, events)
            .instrument(span)
            .await;
        if let Err(err @ AppError::InvalidTransition(_)) = &result {
            error!(session_id = %session.id(), %err, "session state machine misuse");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut UploadSession,
        source: Arc<dyn ChunkSource>,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<UploadReport> {
        let session_id = session.id().to_owned();
        info!(
            file_name = session.file_name(),
            destination = session.destination_path(),
            total_bytes = session.total_bytes(),
            total_chunks = session.total_chunks(),
            "upload started"
        );

        if source.len() != session.total_bytes() {
            return Err(AppError::InvalidInput(format!(
                "source holds {} bytes but session expects {}",
                source.len(),
                session.total_bytes()
            )));
        }

        let descriptors: Vec<_> = session.slicer()?.iter().collect();
        let outcome = match self
            .scheduler
            .run(
                session,
                descriptors,
                source,
                Arc::clone(&self.transport),
                cancel,
                events,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%err, "scheduler run failed");
                emit(
                    events,
                    UploadEvent::Failed {
                        session_id,
                        error: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        match outcome {
            RunOutcome::AllAcked => {}
            RunOutcome::AbortedAt { index, error } => {
                let failure = AppError::SessionFailed(format!("chunk {index} failed: {error}"));
                emit(
                    events,
                    UploadEvent::Failed {
                        session_id,
                        error: failure.to_string(),
                    },
                );
                return Err(failure);
            }
            RunOutcome::Cancelled => {
                emit(events, UploadEvent::Cancelled { session_id: session_id.clone() });
                return Err(AppError::Cancelled(format!("upload {session_id} cancelled")));
            }
        }

        if cancel.is_cancelled() {
            session.cancel()?;
            emit(events, UploadEvent::Cancelled { session_id: session_id.clone() });
            return Err(AppError::Cancelled(format!(
                "upload {session_id} cancelled before finalize"
            )));
        }

        match self
            .finalizer
            .finalize(session, self.transport.as_ref(), cancel, events)
            .await
        {
            Ok(receipt) => {
                emit(
                    events,
                    UploadEvent::Completed {
                        session_id: session_id.clone(),
                        receipt: receipt.clone(),
                    },
                );
                info!(total_bytes = session.total_bytes(), "upload completed");
                Ok(UploadReport {
                    session_id,
                    total_bytes: session.total_bytes(),
                    total_chunks: session.total_chunks(),
                    receipt,
                })
            }
            Err(err @ AppError::Cancelled(_)) => {
                emit(events, UploadEvent::Cancelled { session_id });
                Err(err)
            }
            Err(err) => {
                error!(%err, "upload failed during finalize");
                emit(
                    events,
                    UploadEvent::Failed {
                        session_id,
                        error: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }
}
