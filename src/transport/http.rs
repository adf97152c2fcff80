//! HTTP implementation of [`ChunkTransport`] over the remote file API.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ChunkTransport, FinalizeReceipt, FinalizeRequest};
use crate::config::RemoteConfig;
use crate::credentials::Credentials;
use crate::models::chunk::ChunkDescriptor;
use crate::models::session::UploadTarget;
use crate::{AppError, Result};

/// Route accepting one multipart chunk.
pub const CHUNK_ROUTE: &str = "/files/upload/chunk";
/// Route assembling staged chunks.
pub const FINALIZE_ROUTE: &str = "/files/upload/finalize";

/// Error body shared by every endpoint of the file API.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Finalize body; `success` may be false with an `error` message.
#[derive(Debug, Deserialize)]
struct FinalizeBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    sha256: Option<String>,
}

/// Transport posting chunks and finalize requests with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    api_root: String,
    credentials: Arc<Credentials>,
}

impl HttpTransport {
    /// Build a transport for `remote` authenticating with `credentials`.
    #[must_use]
    pub fn new(remote: &RemoteConfig, credentials: Arc<Credentials>) -> Self {
        Self::with_client(reqwest::Client::new(), remote, credentials)
    }

    /// Build a transport around an existing client.
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        remote: &RemoteConfig,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            client,
            api_root: remote.api_root(),
            credentials,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.token() {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    /// Map a `401` to credential invalidation; pass everything else through.
    fn check_unauthorized(&self, response: &Response) -> Result<()> {
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %response.url(), "remote rejected credentials");
            self.credentials.invalidate();
            return Err(AppError::Unauthorized(
                "remote rejected the stored token".into(),
            ));
        }
        Ok(())
    }

    async fn post_chunk(
        &self,
        target: &UploadTarget,
        descriptor: &ChunkDescriptor,
        bytes: Bytes,
    ) -> Result<()> {
        let length = bytes.len() as u64;
        let chunk = Part::stream_with_length(reqwest::Body::from(bytes), length)
            .file_name(target.file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("upload_id", target.upload_id.clone())
            .text("index", descriptor.index.to_string())
            .text("total", target.total_chunks.to_string())
            .text("filename", target.file_name.clone())
            .text("path", target.destination_path.clone())
            .part("chunk", chunk);

        let url = format!("{}{CHUNK_ROUTE}", self.api_root);
        let response = self
            .authorized(self.client.post(&url))
            .multipart(form)
            .send()
            .await?;
        self.check_unauthorized(&response)?;

        let status = response.status();
        if status.is_success() {
            debug!(upload_id = %target.upload_id, index = descriptor.index, "chunk accepted");
            return Ok(());
        }
        let body: ErrorBody = response.json().await.unwrap_or_default();
        let message = body
            .error
            .unwrap_or_else(|| format!("chunk upload returned {status}"));
        // A rejected request fails the same way on every resend.
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            return Err(AppError::InvalidInput(message));
        }
        Err(AppError::Transport(message))
    }

    async fn post_finalize(&self, target: &UploadTarget) -> Result<FinalizeReceipt> {
        let url = format!("{}{FINALIZE_ROUTE}", self.api_root);
        let response = self
            .authorized(self.client.post(&url))
            .json(&FinalizeRequest::from(target))
            .send()
            .await
            .map_err(|err| AppError::Finalize(format!("finalize request failed: {err}")))?;
        self.check_unauthorized(&response)?;

        let status = response.status();
        let body: Option<FinalizeBody> = response.json().await.ok();
        match body {
            Some(body) if status.is_success() && body.success => Ok(FinalizeReceipt {
                success: true,
                path: body.path,
                size: body.size,
                sha256: body.sha256,
            }),
            Some(FinalizeBody {
                error: Some(message),
                ..
            }) => Err(AppError::Finalize(message)),
            _ => Err(AppError::Finalize(format!(
                "finalize returned {status} without success"
            ))),
        }
    }
}

impl ChunkTransport for HttpTransport {
    fn send<'a>(
        &'a self,
        target: &'a UploadTarget,
        descriptor: &'a ChunkDescriptor,
        bytes: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.post_chunk(target, descriptor, bytes))
    }

    fn finalize<'a>(
        &'a self,
        target: &'a UploadTarget,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeReceipt>> + Send + 'a>> {
        Box::pin(self.post_finalize(target))
    }
}
