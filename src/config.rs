//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Remote endpoint the uploader talks to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteConfig {
    /// Scheme, host and port of the file API (e.g. `http://127.0.0.1:5002`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path prefix every API route lives under.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
        }
    }
}

impl RemoteConfig {
    /// Base URL joined with the API prefix, without a trailing slash.
    #[must_use]
    pub fn api_root(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.api_prefix.trim_end_matches('/')
        )
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5002".into()
}

fn default_api_prefix() -> String {
    "/cloud/api".into()
}

/// Exponential backoff applied between chunk retries.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    /// Multiplier applied per consecutive failure.
    #[serde(default = "default_backoff_factor")]
    pub factor: u32,
    /// Upper bound for any single delay.
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            factor: default_backoff_factor(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

/// Chunking and scheduling parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UploadConfig {
    /// Fixed size of every chunk but the last.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    /// Maximum chunks in flight per session.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Failures a single chunk may accumulate before the session aborts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Client-side timeout for one chunk request.
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_seconds: u64,
    /// Retry backoff policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            chunk_timeout_seconds: default_chunk_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl UploadConfig {
    /// Chunk timeout as a [`Duration`].
    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_seconds)
    }
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_timeout() -> u64 {
    60
}

/// Finalize retry parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FinalizeConfig {
    /// Total finalize requests issued before the session fails.
    #[serde(default = "default_finalize_attempts")]
    pub attempts: u32,
    /// Fixed delay between finalize attempts.
    #[serde(default = "default_finalize_delay_ms")]
    pub delay_ms: u64,
    /// Client-side timeout for one finalize request. Assembly of a large
    /// file happens inside this window.
    #[serde(default = "default_finalize_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            attempts: default_finalize_attempts(),
            delay_ms: default_finalize_delay_ms(),
            timeout_ms: default_finalize_timeout_ms(),
        }
    }
}

impl FinalizeConfig {
    /// Finalize timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_finalize_attempts() -> u32 {
    3
}

fn default_finalize_delay_ms() -> u64 {
    1_000
}

fn default_finalize_timeout_ms() -> u64 {
    300_000
}

/// Backing store for the persisted bearer token.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStoreKind {
    /// JSON file on disk.
    #[default]
    File,
    /// OS keychain.
    Keyring,
    /// Process memory only; nothing survives a restart.
    Memory,
}

/// Credential persistence settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CredentialsConfig {
    /// Which store holds the token.
    #[serde(default)]
    pub store: CredentialStoreKind,
    /// Token file used by the `file` store.
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            store: CredentialStoreKind::default(),
            token_file: default_token_file(),
        }
    }
}

fn default_token_file() -> PathBuf {
    PathBuf::from(".pincerna").join("token.json")
}

/// Reference receiver settings used by `pincerna-upload serve`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReceiverConfig {
    /// Socket address to bind.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory assembled files are written under.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Token every request must present; `None` disables the check.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Largest request body accepted, which bounds the chunk size.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Staged uploads idle this long are discarded.
    #[serde(default = "default_staging_ttl")]
    pub staging_ttl_seconds: u64,
    /// Finalize receipts are kept this long for repeat requests.
    #[serde(default = "default_receipt_ttl")]
    pub receipt_ttl_seconds: u64,
    /// Period of the staging sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            storage_root: default_storage_root(),
            auth_token: None,
            max_body_bytes: default_max_body_bytes(),
            staging_ttl_seconds: default_staging_ttl(),
            receipt_ttl_seconds: default_receipt_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl ReceiverConfig {
    /// Idle time after which a staged upload is discarded.
    #[must_use]
    pub fn staging_ttl(&self) -> Duration {
        Duration::from_secs(self.staging_ttl_seconds)
    }

    /// Age after which a recorded receipt is discarded.
    #[must_use]
    pub fn receipt_ttl(&self) -> Duration {
        Duration::from_secs(self.receipt_ttl_seconds)
    }

    /// Period of the background sweep.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

fn default_bind() -> String {
    "127.0.0.1:5002".into()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_staging_ttl() -> u64 {
    24 * 60 * 60
}

fn default_receipt_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Remote file API.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Chunking and scheduling.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Finalize retry policy.
    #[serde(default)]
    pub finalize: FinalizeConfig,
    /// Token persistence.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Reference receiver.
    #[serde(default)]
    pub receiver: ReceiverConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !(self.remote.base_url.starts_with("http://")
            || self.remote.base_url.starts_with("https://"))
        {
            return Err(AppError::Config(
                "remote.base_url must start with http:// or https://".into(),
            ));
        }
        if !(self.remote.api_prefix.is_empty() || self.remote.api_prefix.starts_with('/')) {
            return Err(AppError::Config(
                "remote.api_prefix must be empty or start with /".into(),
            ));
        }
        if self.upload.chunk_size_bytes == 0 {
            return Err(AppError::Config(
                "upload.chunk_size_bytes must be greater than zero".into(),
            ));
        }
        if self.upload.concurrency == 0 {
            return Err(AppError::Config(
                "upload.concurrency must be greater than zero".into(),
            ));
        }
        if self.upload.max_retries == 0 {
            return Err(AppError::Config(
                "upload.max_retries must be greater than zero".into(),
            ));
        }
        if self.upload.chunk_timeout_seconds == 0 {
            return Err(AppError::Config(
                "upload.chunk_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.upload.backoff.factor == 0 {
            return Err(AppError::Config(
                "upload.backoff.factor must be at least 1".into(),
            ));
        }
        if self.receiver.max_body_bytes == 0 {
            return Err(AppError::Config(
                "receiver.max_body_bytes must be greater than zero".into(),
            ));
        }
        if self.finalize.timeout_ms == 0 {
            return Err(AppError::Config(
                "finalize.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.receiver.sweep_interval_seconds == 0 {
            return Err(AppError::Config(
                "receiver.sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.finalize.attempts == 0 {
            return Err(AppError::Config(
                "finalize.attempts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
