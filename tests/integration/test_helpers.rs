//! Shared helpers for integration tests.
//!
//! Starts the receiver on an ephemeral port and builds HTTP transports and
//! coordinators pointed at it.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pincerna_uploader::config::{ReceiverConfig, RemoteConfig};
use pincerna_uploader::credentials::{Credentials, MemoryTokenStore, TokenStore};
use pincerna_uploader::orchestrator::coordinator::UploadCoordinator;
use pincerna_uploader::receiver::{serve_listener, ReceiverState};
use pincerna_uploader::transport::http::HttpTransport;
use pincerna_uploader::GlobalConfig;

pub const API_PREFIX: &str = "/cloud/api";

/// Running receiver; shuts down when dropped.
pub struct TestReceiver {
    pub addr: SocketAddr,
    pub state: Arc<ReceiverState>,
    ct: CancellationToken,
    root: Arc<tempfile::TempDir>,
    auth_token: Option<String>,
}

impl TestReceiver {
    pub fn storage_root(&self) -> &Path {
        self.state.storage_root()
    }

    /// Stop this receiver and start a fresh one on the same storage root.
    /// Nothing but the files on disk carries over.
    pub async fn restart(&self) -> TestReceiver {
        self.ct.cancel();
        start(Arc::clone(&self.root), self.auth_token.as_deref()).await
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn remote(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.base_url(),
            api_prefix: API_PREFIX.into(),
        }
    }

    /// Configuration with fast retries aimed at this receiver.
    pub fn config(&self) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.remote = self.remote();
        config.upload.backoff.base_ms = 1;
        config.upload.backoff.max_ms = 5;
        config.upload.chunk_timeout_seconds = 10;
        config.finalize.delay_ms = 1;
        config
    }

    /// Transport holding `token`, plus the credentials and store behind it.
    pub fn transport(
        &self,
        token: Option<&str>,
    ) -> (Arc<HttpTransport>, Arc<Credentials>, Arc<MemoryTokenStore>) {
        let store = Arc::new(match token {
            Some(token) => MemoryTokenStore::with_token(token),
            None => MemoryTokenStore::default(),
        });
        let credentials = Arc::new(Credentials::load(
            Arc::clone(&store) as Arc<dyn TokenStore>
        ));
        let transport = Arc::new(HttpTransport::new(&self.remote(), Arc::clone(&credentials)));
        (transport, credentials, store)
    }

    pub fn coordinator(&self, token: Option<&str>, chunk_size: u64) -> UploadCoordinator {
        let mut config = self.config();
        config.upload.chunk_size_bytes = chunk_size;
        let (transport, _, _) = self.transport(token);
        UploadCoordinator::from_config(&config, transport)
    }
}

impl Drop for TestReceiver {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

/// Start a receiver on `127.0.0.1:0`.
pub async fn spawn_receiver(auth_token: Option<&str>) -> TestReceiver {
    let root = Arc::new(tempfile::tempdir().expect("tempdir"));
    start(root, auth_token).await
}

async fn start(root: Arc<tempfile::TempDir>, auth_token: Option<&str>) -> TestReceiver {
    let config = ReceiverConfig {
        storage_root: root.path().to_path_buf(),
        auth_token: auth_token.map(str::to_owned),
        ..ReceiverConfig::default()
    };
    let state = Arc::new(ReceiverState::new(&config).expect("receiver state"));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");
    let ct = CancellationToken::new();

    tokio::spawn(serve_listener(
        listener,
        Arc::clone(&state),
        API_PREFIX,
        ct.clone(),
    ));

    TestReceiver {
        addr,
        state,
        ct,
        root,
        auth_token: auth_token.map(str::to_owned),
    }
}

/// `len` bytes of a repeating, position-dependent pattern.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from(i % 251).unwrap_or_default())
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
