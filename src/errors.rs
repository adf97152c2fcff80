//! Error types shared across the uploader.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all upload failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed construction arguments, rejected before any I/O.
    InvalidInput(String),
    /// State machine misuse; always a caller defect.
    InvalidTransition(String),
    /// A single chunk request failed or timed out. Retryable.
    Transport(String),
    /// The server refused or failed to assemble the upload.
    Finalize(String),
    /// The session is terminally failed; carries the last underlying error.
    SessionFailed(String),
    /// The session was cancelled before completion.
    Cancelled(String),
    /// The remote rejected the stored credentials.
    Unauthorized(String),
    /// Destination path failed validation against the storage root.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the scheduler may retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Finalize(msg) => write!(f, "finalize: {msg}"),
            Self::SessionFailed(msg) => write!(f, "session failed: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport("request timed out".into())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
