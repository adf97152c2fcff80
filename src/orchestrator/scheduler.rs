//! Bounded-parallel chunk dispatch with per-chunk retry.
//!
//! The scheduler is the single writer of an [`UploadSession`]. Spawned tasks
//! only perform I/O (source read, transport send) and hand
//! `(descriptor, result)` back through a [`JoinSet`]; the scheduler applies
//! those results to the session one at a time in arrival order.
//!
//! Failed chunks are requeued with exponential backoff until their failure
//! count reaches `max_retries`, at which point the run aborts. Abort and
//! cancellation both detach outstanding tasks: they run to completion but
//! their results are never applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::events::{emit, EventSender, UploadEvent};
use crate::config::UploadConfig;
use crate::models::chunk::ChunkDescriptor;
use crate::models::progress::progress;
use crate::models::session::{ChunkState, SessionStatus, UploadSession, UploadTarget};
use crate::source::ChunkSource;
use crate::transport::ChunkTransport;
use crate::{AppError, Result};

/// Tuning knobs for a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Maximum chunks in flight at once.
    pub concurrency: usize,
    /// Failures one chunk may accumulate before the run aborts.
    pub max_retries: u32,
    /// Client-side timeout around each send.
    pub chunk_timeout: Duration,
    /// Delay policy between a failure and the resend.
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for SchedulerOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_retries: config.max_retries,
            chunk_timeout: config.chunk_timeout(),
            backoff: BackoffPolicy::from(&config.backoff),
        }
    }
}

/// Terminal result of [`ConcurrencyScheduler::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every chunk was acknowledged.
    AllAcked,
    /// The chunk at `index` could not be delivered; the session is failed.
    AbortedAt {
        /// First chunk whose failure ended the run.
        index: usize,
        /// Last error that chunk produced.
        error: AppError,
    },
    /// The cancellation token fired; the session is cancelled.
    Cancelled,
}

/// Work queue entry: a chunk plus how long to wait before sending it.
struct Dispatch {
    descriptor: ChunkDescriptor,
    delay: Duration,
}

type ChunkResult = (ChunkDescriptor, Result<u64>);

/// Drives every pending chunk of a session through a [`ChunkTransport`].
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyScheduler {
    options: SchedulerOptions,
}

impl ConcurrencyScheduler {
    /// Scheduler with the given options. Zero concurrency or retries are
    /// raised to one.
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            options: SchedulerOptions {
                concurrency: options.concurrency.max(1),
                max_retries: options.max_retries.max(1),
                ..options
            },
        }
    }

    /// Effective options.
    #[must_use]
    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Upload every descriptor whose chunk is still `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the session is not active or
    /// a state update is rejected, and `AppError::InvalidInput` if a
    /// descriptor belongs to another session or the descriptors leave chunks
    /// unacked. Transport failures are reported through [`RunOutcome`], not
    /// as errors.
    pub async fn run(
        &self,
        session: &mut UploadSession,
        descriptors: impl IntoIterator<Item = ChunkDescriptor>,
        source: Arc<dyn ChunkSource>,
        transport: Arc<dyn ChunkTransport>,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> Result<RunOutcome> {
        if session.status() != SessionStatus::Active {
            return Err(AppError::InvalidTransition(format!(
                "scheduler run on session in {:?}",
                session.status()
            )));
        }

        let mut queue = VecDeque::new();
        for descriptor in descriptors {
            if descriptor.session_id != session.id() {
                return Err(AppError::InvalidInput(format!(
                    "descriptor for session {} passed to session {}",
                    descriptor.session_id,
                    session.id()
                )));
            }
            if session.chunk_state(descriptor.index) == Some(ChunkState::Pending) {
                queue.push_back(Dispatch {
                    descriptor,
                    delay: Duration::ZERO,
                });
            }
        }

        let target = Arc::new(session.target());
        let mut failures: HashMap<usize, u32> = HashMap::new();
        let mut in_flight: JoinSet<ChunkResult> = JoinSet::new();

        debug!(
            session_id = %session.id(),
            queued = queue.len(),
            concurrency = self.options.concurrency,
            "scheduler run started"
        );

        loop {
            if cancel.is_cancelled() {
                return Self::cancel_run(session, &mut in_flight);
            }

            while in_flight.len() < self.options.concurrency {
                let Some(dispatch) = queue.pop_front() else {
                    break;
                };
                session.mark_in_flight(dispatch.descriptor.index)?;
                self.spawn_chunk(
                    &mut in_flight,
                    dispatch,
                    Arc::clone(&source),
                    Arc::clone(&transport),
                    Arc::clone(&target),
                );
            }

            if in_flight.is_empty() {
                break;
            }

            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                joined = in_flight.join_next() => Some(joined),
            };
            let Some(joined) = next else {
                return Self::cancel_run(session, &mut in_flight);
            };
            let Some(joined) = joined else {
                continue;
            };

            let (descriptor, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    in_flight.detach_all();
                    session.fail()?;
                    error!(session_id = %session.id(), %err, "chunk task lost");
                    return Err(AppError::SessionFailed(format!("chunk task lost: {err}")));
                }
            };
            let index = descriptor.index;

            match result {
                Ok(bytes_written) => {
                    session.mark_acked(index, bytes_written)?;
                    failures.remove(&index);
                    let snapshot = progress(session);
                    debug!(
                        session_id = %session.id(),
                        index,
                        percent = snapshot.percent,
                        "chunk acked"
                    );
                    emit(
                        events,
                        UploadEvent::ChunkAcked {
                            session_id: session.id().to_owned(),
                            index,
                            progress: snapshot,
                        },
                    );
                }
                Err(err) => {
                    session.mark_failed(index)?;
                    let count = failures.entry(index).or_insert(0);
                    *count += 1;
                    let attempt = *count;

                    if !err.is_retryable() || attempt >= self.options.max_retries {
                        return Self::abort_run(session, &mut in_flight, index, attempt, err);
                    }

                    let delay = self.options.backoff.delay_for(attempt);
                    warn!(
                        session_id = %session.id(),
                        index,
                        attempt,
                        ?delay,
                        %err,
                        "chunk failed; retrying"
                    );
                    emit(
                        events,
                        UploadEvent::ChunkRetrying {
                            session_id: session.id().to_owned(),
                            index,
                            attempt,
                            delay,
                            error: err.to_string(),
                        },
                    );
                    session.requeue(index)?;
                    queue.push_back(Dispatch { descriptor, delay });
                }
            }
        }

        if !session.all_acked() {
            let acked = session.acked_count();
            return Err(AppError::InvalidInput(format!(
                "descriptors left {} of {} chunks unacked",
                session.total_chunks() - acked,
                session.total_chunks()
            )));
        }

        debug!(session_id = %session.id(), "all chunks acked");
        Ok(RunOutcome::AllAcked)
    }

    fn spawn_chunk(
        &self,
        in_flight: &mut JoinSet<ChunkResult>,
        dispatch: Dispatch,
        source: Arc<dyn ChunkSource>,
        transport: Arc<dyn ChunkTransport>,
        target: Arc<UploadTarget>,
    ) {
        let Dispatch { descriptor, delay } = dispatch;
        let chunk_timeout = self.options.chunk_timeout;
        let returned = descriptor.clone();

        // The inner task isolates transport panics so every result still
        // carries its descriptor back to the scheduler.
        in_flight.spawn(async move {
            let work = tokio::spawn(send_chunk(
                descriptor,
                delay,
                chunk_timeout,
                source,
                transport,
                target,
            ));
            let result = match work.await {
                Ok(result) => result,
                Err(err) => Err(AppError::SessionFailed(format!(
                    "chunk {} task panicked: {err}",
                    returned.index
                ))),
            };
            (returned, result)
        });
    }

    fn abort_run(
        session: &mut UploadSession,
        in_flight: &mut JoinSet<ChunkResult>,
        index: usize,
        attempt: u32,
        err: AppError,
    ) -> Result<RunOutcome> {
        in_flight.detach_all();
        session.fail()?;
        error!(
            session_id = %session.id(),
            index,
            attempt,
            %err,
            "chunk exhausted retries; upload aborted"
        );
        Ok(RunOutcome::AbortedAt { index, error: err })
    }

    fn cancel_run(
        session: &mut UploadSession,
        in_flight: &mut JoinSet<ChunkResult>,
    ) -> Result<RunOutcome> {
        let abandoned = in_flight.len();
        in_flight.detach_all();
        session.cancel()?;
        info!(
            session_id = %session.id(),
            acked = session.acked_count(),
            abandoned,
            "upload cancelled"
        );
        Ok(RunOutcome::Cancelled)
    }
}

/// Read one chunk and send it, honouring the retry delay and the timeout.
async fn send_chunk(
    descriptor: ChunkDescriptor,
    delay: Duration,
    chunk_timeout: Duration,
    source: Arc<dyn ChunkSource>,
    transport: Arc<dyn ChunkTransport>,
    target: Arc<UploadTarget>,
) -> Result<u64> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let bytes = source.read(&descriptor).await?;
    let length = bytes.len() as u64;
    match tokio::time::timeout(chunk_timeout, transport.send(&target, &descriptor, bytes)).await {
        Ok(Ok(())) => Ok(length),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(AppError::Transport(format!(
            "chunk {} timed out after {chunk_timeout:?}",
            descriptor.index
        ))),
    }
}
