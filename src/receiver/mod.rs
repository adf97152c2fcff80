//! Reference receiver for the chunked upload protocol.
//!
//! An axum service exposing the same routes [`HttpTransport`] calls. Chunks
//! are staged on disk per upload id and assembled on finalize. Finalize is
//! idempotent: it runs under the upload's exclusive lock and records its
//! receipt on disk before staging is cleared, so a duplicate request,
//! concurrent or after a restart, returns the recorded receipt instead of
//! assembling twice. A background sweep discards uploads that went idle and
//! receipts past their retention.
//!
//! [`HttpTransport`]: crate::transport::http::HttpTransport

pub mod locks;
pub mod path_safety;
pub mod staging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use self::locks::UploadLocks;
use self::path_safety::{resolve_destination, validate_upload_id};
use self::staging::{Manifest, StagingArea};
use crate::config::ReceiverConfig;
use crate::transport::http::{CHUNK_ROUTE, FINALIZE_ROUTE};
use crate::transport::{FinalizeReceipt, FinalizeRequest};
use crate::{AppError, Result};

/// Shared receiver state.
#[derive(Debug)]
pub struct ReceiverState {
    storage_root: PathBuf,
    staging: StagingArea,
    auth_token: Option<String>,
    max_body_bytes: usize,
    staging_ttl: Duration,
    receipt_ttl: Duration,
    sweep_interval: Duration,
    locks: UploadLocks,
}

/// What one staging sweep discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle uploads whose staged parts were deleted.
    pub uploads: usize,
    /// Receipts dropped after their retention.
    pub receipts: usize,
}

impl ReceiverState {
    /// State for `config`, creating the storage root if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the storage root cannot be created or
    /// resolved.
    pub fn new(config: &ReceiverConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_root).map_err(|err| {
            AppError::Io(format!(
                "failed to create storage root {}: {err}",
                config.storage_root.display()
            ))
        })?;
        let storage_root = config.storage_root.canonicalize().map_err(|err| {
            AppError::Io(format!(
                "failed to resolve storage root {}: {err}",
                config.storage_root.display()
            ))
        })?;
        Ok(Self {
            staging: StagingArea::new(&storage_root),
            storage_root,
            auth_token: config.auth_token.clone(),
            max_body_bytes: config.max_body_bytes,
            staging_ttl: config.staging_ttl(),
            receipt_ttl: config.receipt_ttl(),
            sweep_interval: config.sweep_interval(),
            locks: UploadLocks::new(),
        })
    }

    /// Canonical storage root.
    #[must_use]
    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    async fn store_chunk(
        self: Arc<Self>,
        form: ChunkForm,
    ) -> std::result::Result<ChunkAck, ApiError> {
        validate_upload_id(&form.upload_id)?;
        if form.total == 0 || form.index >= form.total {
            return Err(AppError::InvalidInput(format!(
                "chunk index {} out of range for total {}",
                form.index, form.total
            ))
            .into());
        }
        resolve_destination(&self.storage_root, &form.path, &form.filename)?;

        let handle = self.locks.acquire(&form.upload_id);
        let _shared = handle.shared().await;

        let staging = self.staging.clone();
        let upload_id = form.upload_id.clone();
        if blocking(move || staging.read_receipt(&upload_id))
            .await?
            .is_some()
        {
            return Err(ApiError::conflict(format!(
                "upload {} already finalized",
                form.upload_id
            )));
        }

        let declared = Manifest {
            filename: form.filename,
            path: form.path,
            total: form.total,
        };
        {
            let _manifest = handle.manifest().await;
            let staging = self.staging.clone();
            let upload_id = form.upload_id.clone();
            let recorded = blocking(move || staging.read_manifest(&upload_id)).await?;
            match recorded {
                Some(manifest) if manifest != declared => {
                    return Err(ApiError::conflict(format!(
                        "chunk disagrees with upload {}: expected {} chunks of {:?} in {:?}",
                        form.upload_id, manifest.total, manifest.filename, manifest.path
                    )));
                }
                Some(_) => {}
                None => {
                    let staging = self.staging.clone();
                    let upload_id = form.upload_id.clone();
                    blocking(move || staging.write_manifest(&upload_id, &declared)).await?;
                }
            }
        }

        let staging = self.staging.clone();
        let upload_id = form.upload_id.clone();
        let index = form.index;
        let size = form.data.len();
        let data = form.data;
        blocking(move || staging.write_part(&upload_id, index, &data)).await?;

        info!(size, "chunk staged");
        Ok(ChunkAck {
            success: true,
            index,
        })
    }

    async fn finalize(
        self: Arc<Self>,
        request: FinalizeRequest,
    ) -> std::result::Result<FinalizeReceipt, ApiError> {
        validate_upload_id(&request.upload_id)?;

        // Duplicate finalizes of this upload queue here; others proceed.
        let handle = self.locks.acquire(&request.upload_id);
        let _exclusive = handle.exclusive().await;

        let staging = self.staging.clone();
        let upload_id = request.upload_id.clone();
        if let Some(receipt) = blocking(move || staging.read_receipt(&upload_id)).await? {
            info!("repeat finalize; returning recorded receipt");
            return Ok(receipt);
        }

        let staging = self.staging.clone();
        let upload_id = request.upload_id.clone();
        let recorded = blocking(move || staging.read_manifest(&upload_id)).await?;
        let manifest = match (recorded, request.total) {
            (Some(manifest), _) => manifest,
            (None, Some(0)) => Manifest {
                filename: request.filename.clone(),
                path: request.path.clone(),
                total: 0,
            },
            (None, Some(_)) => {
                return Err(ApiError::conflict(format!(
                    "no chunks received for upload {}",
                    request.upload_id
                )));
            }
            (None, None) => {
                return Err(AppError::NotFound(format!(
                    "unknown upload {}",
                    request.upload_id
                ))
                .into());
            }
        };

        if manifest.filename != request.filename || manifest.path != request.path {
            return Err(ApiError::conflict(format!(
                "finalize target {:?} in {:?} does not match upload",
                request.filename, request.path
            )));
        }
        if request.total.is_some_and(|total| total != manifest.total) {
            return Err(ApiError::conflict(format!(
                "finalize expects {:?} chunks but upload declared {}",
                request.total, manifest.total
            )));
        }

        let destination =
            resolve_destination(&self.storage_root, &manifest.path, &manifest.filename)?;
        let staging = self.staging.clone();
        let upload_id = request.upload_id.clone();
        let total = manifest.total;
        let missing = blocking(move || Ok(staging.missing_parts(&upload_id, total))).await?;
        if !missing.is_empty() {
            warn!(missing = missing.len(), "finalize with missing chunks");
            return Err(ApiError::conflict(format!(
                "missing {} of {} chunks, first missing index {}",
                missing.len(),
                manifest.total,
                missing[0]
            )));
        }

        let staging = self.staging.clone();
        let upload_id = request.upload_id.clone();
        let target = destination.clone();
        let total = manifest.total;
        let assembled = blocking(move || staging.assemble(&upload_id, total, &target)).await?;

        let relative = destination
            .strip_prefix(&self.storage_root)
            .unwrap_or(&destination);
        let receipt = FinalizeReceipt {
            success: true,
            path: Some(format!("/{}", relative.to_string_lossy())),
            size: Some(assembled.size),
            sha256: Some(assembled.sha256),
        };
        info!(
            path = receipt.path.as_deref().unwrap_or_default(),
            size = assembled.size,
            "upload assembled"
        );

        // The receipt must be durable before the parts it replaces are gone.
        let staging = self.staging.clone();
        let upload_id = request.upload_id.clone();
        let recorded = receipt.clone();
        blocking(move || staging.write_receipt(&upload_id, &recorded)).await?;

        let staging = self.staging.clone();
        let upload_id = request.upload_id;
        if let Err(err) = blocking(move || staging.remove(&upload_id)).await {
            warn!(%err, "failed to clean staging after assembly");
        }
        Ok(receipt)
    }

    /// Discard uploads idle for longer than the staging TTL and receipts
    /// older than the receipt TTL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the staging area cannot be listed or
    /// cleaned.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = SystemTime::now();
        let idle_cutoff = now
            .checked_sub(self.staging_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let receipt_cutoff = now
            .checked_sub(self.receipt_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.sweep_before(idle_cutoff, receipt_cutoff).await
    }

    /// Discard uploads with no chunk since `idle_cutoff` and receipts
    /// recorded before `receipt_cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the staging area cannot be listed or
    /// cleaned.
    pub async fn sweep_before(
        &self,
        idle_cutoff: SystemTime,
        receipt_cutoff: SystemTime,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let staging = self.staging.clone();
        let candidates = blocking(move || staging.idle_uploads(idle_cutoff)).await?;
        for upload_id in candidates {
            let handle = self.locks.acquire(&upload_id);
            let _exclusive = handle.exclusive().await;

            // A chunk or a finalize may have landed while the lock was awaited.
            let staging = self.staging.clone();
            let id = upload_id.clone();
            let discarded = blocking(move || match staging.last_activity(&id)? {
                Some(at) if at < idle_cutoff => staging.remove(&id).map(|()| true),
                _ => Ok(false),
            })
            .await?;
            if discarded {
                info!(%upload_id, "discarded idle upload");
                report.uploads += 1;
            }
        }

        let staging = self.staging.clone();
        report.receipts = blocking(move || staging.expire_receipts(receipt_cutoff)).await?;
        Ok(report)
    }
}

/// Response to an accepted chunk.
#[derive(Debug, Serialize)]
struct ChunkAck {
    success: bool,
    index: usize,
}

/// Multipart fields of a chunk request.
#[derive(Debug, Default)]
struct ChunkForm {
    upload_id: String,
    index: usize,
    total: usize,
    filename: String,
    path: String,
    data: Bytes,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> std::result::Result<Self, ApiError> {
        let mut form = Self::default();
        let mut have_chunk = false;
        while let Some(field) = multipart.next_field().await.map_err(ApiError::bad_form)? {
            let name = field.name().unwrap_or_default().to_owned();
            match name.as_str() {
                "chunk" => {
                    form.data = field.bytes().await.map_err(ApiError::bad_form)?;
                    have_chunk = true;
                }
                "upload_id" => form.upload_id = field.text().await.map_err(ApiError::bad_form)?,
                "filename" => form.filename = field.text().await.map_err(ApiError::bad_form)?,
                "path" => form.path = field.text().await.map_err(ApiError::bad_form)?,
                "index" | "total" => {
                    let raw = field.text().await.map_err(ApiError::bad_form)?;
                    let count = parse_count(&name, &raw)?;
                    if name == "index" {
                        form.index = count;
                    } else {
                        form.total = count;
                    }
                }
                _ => {}
            }
        }
        if !have_chunk {
            return Err(AppError::InvalidInput("missing chunk field".into()).into());
        }
        Ok(form)
    }
}

fn parse_count(name: &str, raw: &str) -> std::result::Result<usize, ApiError> {
    raw.trim().parse().map_err(|err| {
        AppError::InvalidInput(format!("field {name} is not a count: {err}")).into()
    })
}

/// Error response with the `{success:false, error}` body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn conflict(message: String) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message,
        }
    }

    fn bad_form(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("malformed multipart body: {err}"),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::InvalidInput(_) | AppError::PathViolation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "success": false, "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| AppError::Io(format!("blocking task failed: {err}")))?
}

async fn health() -> &'static str {
    "ok"
}

async fn receive_chunk(
    State(state): State<Arc<ReceiverState>>,
    multipart: Multipart,
) -> std::result::Result<Json<ChunkAck>, ApiError> {
    let form = ChunkForm::read(multipart).await?;
    let span = info_span!("receive_chunk", upload_id = %form.upload_id, index = form.index);
    state.store_chunk(form).instrument(span).await.map(Json)
}

async fn finalize_upload(
    State(state): State<Arc<ReceiverState>>,
    Json(request): Json<FinalizeRequest>,
) -> std::result::Result<Json<FinalizeReceipt>, ApiError> {
    let span = info_span!("finalize_upload", upload_id = %request.upload_id);
    state.finalize(request).instrument(span).await.map(Json)
}

async fn require_token(
    State(state): State<Arc<ReceiverState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.auth_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected) {
            warn!(path = %request.uri().path(), "rejected request without valid token");
            return ApiError {
                status: StatusCode::UNAUTHORIZED,
                message: "unauthorized".into(),
            }
            .into_response();
        }
    }
    next.run(request).await
}

/// Build the receiver router mounted under `api_prefix`.
pub fn router(state: Arc<ReceiverState>, api_prefix: &str) -> Router {
    let uploads = Router::new()
        .route(CHUNK_ROUTE, post(receive_chunk))
        .route(FINALIZE_ROUTE, post(finalize_upload))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_token,
        ));

    let api = Router::new()
        .route("/health", get(health))
        .merge(uploads)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .with_state(state);

    let prefix = api_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    }
}

/// Serve the receiver described by `config` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the bind address is unusable and
/// `AppError::Io` if the storage root cannot be prepared.
pub async fn serve(config: &ReceiverConfig, api_prefix: &str, ct: CancellationToken) -> Result<()> {
    let state = Arc::new(ReceiverState::new(config)?);
    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {}: {err}", config.bind)))?;
    serve_listener(listener, state, api_prefix, ct).await
}

/// Serve on an already bound listener. Tests bind port 0 and read the
/// address back before calling this.
///
/// # Errors
///
/// Returns `AppError::Io` if the server loop fails.
pub async fn serve_listener(
    listener: TcpListener,
    state: Arc<ReceiverState>,
    api_prefix: &str,
    ct: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("listener has no local address: {err}")))?;
    info!(
        %addr,
        storage_root = %state.storage_root().display(),
        "receiver listening"
    );

    let sweeper = spawn_sweeper(Arc::clone(&state), ct.clone());
    let served = axum::serve(listener, router(state, api_prefix))
        .with_graceful_shutdown(ct.cancelled_owned())
        .await;
    sweeper.abort();
    served.map_err(|err| AppError::Io(format!("receiver error: {err}")))?;

    info!("receiver shut down");
    Ok(())
}

/// Sweep the staging area at startup and then every `sweep_interval`.
fn spawn_sweeper(state: Arc<ReceiverState>, ct: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.sweep_interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = ct.cancelled() => break,
                _ = interval.tick() => match state.sweep().await {
                    Ok(report) if report != SweepReport::default() => {
                        info!(
                            uploads = report.uploads,
                            receipts = report.receipts,
                            "staging swept"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!(%err, "staging sweep failed"),
                },
            }
        }
    })
}
