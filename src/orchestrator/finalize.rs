//! Finalize request issue and retry.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::{emit, EventSender, UploadEvent};
use crate::config::FinalizeConfig;
use crate::models::session::{SessionStatus, UploadSession, UploadTarget};
use crate::transport::{ChunkTransport, FinalizeReceipt};
use crate::{AppError, Result};

/// Requests server-side assembly once every chunk is acked.
///
/// Finalize is idempotent on the remote, so failed attempts are retried on
/// a fixed delay and a session that already completed may be finalized
/// again without changing the stored file. Each attempt is bounded by
/// `timeout`; an expired attempt counts as a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeCoordinator {
    attempts: u32,
    delay: Duration,
    timeout: Duration,
}

impl Default for FinalizeCoordinator {
    fn default() -> Self {
        Self::from(&FinalizeConfig::default())
    }
}

impl From<&FinalizeConfig> for FinalizeCoordinator {
    fn from(config: &FinalizeConfig) -> Self {
        Self::new(config.attempts, Duration::from_millis(config.delay_ms))
            .with_timeout(config.timeout())
    }
}

impl FinalizeCoordinator {
    /// Coordinator issuing at most `attempts` requests, `delay` apart.
    #[must_use]
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            timeout: FinalizeConfig::default().timeout(),
        }
    }

    /// Replace the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One finalize request bounded by the timeout; `None` if `cancel`
    /// fired first.
    async fn attempt(
        &self,
        target: &UploadTarget,
        transport: &dyn ChunkTransport,
        cancel: &CancellationToken,
    ) -> Option<Result<FinalizeReceipt>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(self.timeout, transport.finalize(target)) => {
                Some(result.unwrap_or_else(|_| {
                    Err(AppError::Finalize(format!(
                        "finalize timed out after {:?}",
                        self.timeout
                    )))
                }))
            }
        }
    }

    /// Finalize `session` through `transport`.
    ///
    /// An `Active` session moves to `Finalizing`, then to `Completed` on the
    /// first successful response or to `Failed` once every attempt is spent.
    /// A `Completed` session re-issues the request and keeps its status.
    ///
    /// If `cancel` fires while waiting, the session is failed: the remote may
    /// still assemble the file, so it cannot be reported as cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if chunks are outstanding or the
    /// session failed or was cancelled, `AppError::Unauthorized` without
    /// retrying when credentials are rejected, `AppError::Cancelled` when
    /// `cancel` interrupts the wait, and otherwise the last finalize error
    /// unchanged.
    pub async fn finalize(
        &self,
        session: &mut UploadSession,
        transport: &dyn ChunkTransport,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<FinalizeReceipt> {
        let target = session.target();
        match session.status() {
            SessionStatus::Completed => {
                let receipt = self
                    .attempt(&target, transport, cancel)
                    .await
                    .unwrap_or_else(|| Err(interrupted(session.id())))?;
                info!(session_id = %session.id(), "repeat finalize acknowledged");
                return Ok(receipt);
            }
            SessionStatus::Active => {
                session.begin_finalizing()?;
                emit(
                    events,
                    UploadEvent::Finalizing {
                        session_id: session.id().to_owned(),
                    },
                );
            }
            SessionStatus::Finalizing => {}
            SessionStatus::Failed | SessionStatus::Cancelled => {
                return Err(AppError::InvalidTransition(format!(
                    "cannot finalize session in {:?}",
                    session.status()
                )));
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let Some(result) = self.attempt(&target, transport, cancel).await else {
                session.fail()?;
                warn!(session_id = %session.id(), attempt, "finalize interrupted");
                return Err(interrupted(session.id()));
            };
            match result {
                Ok(receipt) => {
                    session.complete()?;
                    info!(
                        session_id = %session.id(),
                        attempt,
                        path = receipt.path.as_deref().unwrap_or_default(),
                        "upload finalized"
                    );
                    return Ok(receipt);
                }
                Err(err @ AppError::Unauthorized(_)) => {
                    last_error = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(session_id = %session.id(), attempt, %err, "finalize attempt failed");
                    last_error = Some(err);
                    if attempt < self.attempts {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            () = tokio::time::sleep(self.delay) => {}
                        }
                    }
                }
            }
        }

        session.fail()?;
        Err(last_error.unwrap_or_else(|| AppError::Finalize("no finalize attempt made".into())))
    }
}

fn interrupted(session_id: &str) -> AppError {
    AppError::Cancelled(format!("finalize of upload {session_id} interrupted"))
}
