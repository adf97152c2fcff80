//! Persisted bearer token and its in-memory working copy.
//!
//! The token is loaded once at startup from the configured [`TokenStore`],
//! falling back to the `PINCERNA_TOKEN` environment variable. A `401` from
//! the remote calls [`Credentials::invalidate`], which forgets the token in
//! memory and in the store so the next run must log in again.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CredentialStoreKind, CredentialsConfig};
use crate::{AppError, Result};

/// Environment variable consulted when the store holds no token.
pub const TOKEN_ENV_VAR: &str = "PINCERNA_TOKEN";

const KEYRING_SERVICE: &str = "pincerna-uploader";
const KEYRING_ACCOUNT: &str = "token";

/// Durable storage for a single opaque token.
pub trait TokenStore: Send + Sync {
    /// Read the stored token, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Config` if the store is unreadable.
    fn load(&self) -> Result<Option<String>>;

    /// Replace the stored token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Config` if the store is unwritable.
    fn save(&self, token: &str) -> Result<()>;

    /// Remove the stored token. Removing an absent token succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Config` if the store is unwritable.
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    token: String,
}

/// Token kept in a small JSON file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Store backed by `path`. The file is created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to read token file {}: {err}",
                    self.path.display()
                )))
            }
        };
        let parsed: TokenFile = serde_json::from_str(&raw)
            .map_err(|err| AppError::Config(format!("malformed token file: {err}")))?;
        Ok(Some(parsed.token).filter(|token| !token.is_empty()))
    }

    fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!(
                    "failed to create token directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let body = serde_json::to_string(&TokenFile {
            token: token.to_owned(),
        })
        .map_err(|err| AppError::Config(format!("failed to encode token: {err}")))?;
        fs::write(&self.path, body).map_err(|err| {
            AppError::Io(format!(
                "failed to write token file {}: {err}",
                self.path.display()
            ))
        })
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "failed to remove token file {}: {err}",
                self.path.display()
            ))),
        }
    }
}

/// Token kept in the OS keychain.
#[derive(Debug, Clone, Default)]
pub struct KeyringTokenStore;

impl KeyringTokenStore {
    fn entry() -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
            .map_err(|err| AppError::Config(format!("keychain unavailable: {err}")))
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self) -> Result<Option<String>> {
        match Self::entry()?.get_password() {
            Ok(token) if !token.is_empty() => Ok(Some(token)),
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(AppError::Config(format!("keychain lookup failed: {err}"))),
        }
    }

    fn save(&self, token: &str) -> Result<()> {
        Self::entry()?
            .set_password(token)
            .map_err(|err| AppError::Config(format!("keychain write failed: {err}")))
    }

    fn clear(&self) -> Result<()> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(AppError::Config(format!("keychain delete failed: {err}"))),
        }
    }
}

/// Token kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    /// Store pre-seeded with `token`.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, token: &str) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_owned());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Build the store selected by configuration.
#[must_use]
pub fn store_from_config(config: &CredentialsConfig) -> Arc<dyn TokenStore> {
    match config.store {
        CredentialStoreKind::File => Arc::new(FileTokenStore::new(config.token_file.clone())),
        CredentialStoreKind::Keyring => Arc::new(KeyringTokenStore),
        CredentialStoreKind::Memory => Arc::new(MemoryTokenStore::default()),
    }
}

/// Working copy of the token shared by all requests.
pub struct Credentials {
    current: RwLock<Option<String>>,
    store: Arc<dyn TokenStore>,
}

impl Credentials {
    /// Load the token from `store`, falling back to [`TOKEN_ENV_VAR`].
    ///
    /// A store read failure is logged and treated as "no token".
    #[must_use]
    pub fn load(store: Arc<dyn TokenStore>) -> Self {
        let stored = match store.load() {
            Ok(token) => token,
            Err(err) => {
                warn!(%err, "token store lookup failed, trying env var");
                None
            }
        };
        let current = stored.or_else(|| {
            env::var(TOKEN_ENV_VAR)
                .ok()
                .filter(|token| !token.is_empty())
        });
        Self {
            current: RwLock::new(current),
            store,
        }
    }

    /// Current token, if one is held.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist and adopt a new token.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the token cannot be saved.
    pub fn replace(&self, token: &str) -> Result<()> {
        self.store.save(token)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(token.to_owned());
        Ok(())
    }

    /// Forget the token in memory and in the store.
    pub fn invalidate(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(err) = self.store.clear() {
            warn!(%err, "failed to clear stored token");
        }
        info!("stored token invalidated; re-authentication required");
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("has_token", &self.token().is_some())
            .finish_non_exhaustive()
    }
}
