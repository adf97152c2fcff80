//! Chunk transport abstraction.
//!
//! The [`ChunkTransport`] trait is the only I/O boundary the scheduler and
//! finalize coordinator touch. [`http::HttpTransport`] speaks the remote
//! file API; tests substitute in-memory fakes.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::models::chunk::ChunkDescriptor;
use crate::models::session::UploadTarget;
use crate::Result;

/// Successful finalize response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct FinalizeReceipt {
    /// Always `true` for a receipt that reached the caller.
    pub success: bool,
    /// Remote path of the assembled file.
    #[serde(default)]
    pub path: Option<String>,
    /// Size of the assembled file.
    #[serde(default)]
    pub size: Option<u64>,
    /// Hex SHA-256 of the assembled file.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// JSON body of the finalize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FinalizeRequest {
    /// Session identifier.
    pub upload_id: String,
    /// Name of the assembled file.
    pub filename: String,
    /// Destination directory.
    pub path: String,
    /// Expected chunk count; lets the remote assemble an empty file when no
    /// chunk was ever sent.
    #[serde(default)]
    pub total: Option<usize>,
}

impl From<&UploadTarget> for FinalizeRequest {
    fn from(target: &UploadTarget) -> Self {
        Self {
            upload_id: target.upload_id.clone(),
            filename: target.file_name.clone(),
            path: target.destination_path.clone(),
            total: Some(target.total_chunks),
        }
    }
}

/// Sends chunks and finalize requests to the remote store.
///
/// Implementations must be safe to call again with the same
/// `(upload_id, index)`: the remote dedups resends, so a retry after a
/// client-side timeout never corrupts assembly.
pub trait ChunkTransport: Send + Sync {
    /// Upload the bytes of one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`](crate::AppError::Transport) for
    /// retryable failures and
    /// [`AppError::Unauthorized`](crate::AppError::Unauthorized) when the
    /// remote rejects the credentials.
    fn send<'a>(
        &'a self,
        target: &'a UploadTarget,
        descriptor: &'a ChunkDescriptor,
        bytes: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Ask the remote to assemble every acked chunk of `target`.
    ///
    /// Repeating the request for an already assembled upload is a no-op
    /// success on the remote.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Finalize`](crate::AppError::Finalize) carrying the
    /// remote's message when assembly is refused.
    fn finalize<'a>(
        &'a self,
        target: &'a UploadTarget,
    ) -> Pin<Box<dyn Future<Output = Result<FinalizeReceipt>> + Send + 'a>>;
}
