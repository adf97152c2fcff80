//! Unit tests for configuration parsing and validation.

use std::time::Duration;

use pincerna_uploader::config::CredentialStoreKind;
use pincerna_uploader::{AppError, GlobalConfig};

#[test]
fn empty_document_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults valid");
    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.remote.api_root(), "http://127.0.0.1:5002/cloud/api");
    assert_eq!(config.upload.chunk_size_bytes, 4 * 1024 * 1024);
    assert_eq!(config.upload.concurrency, 4);
    assert_eq!(config.upload.max_retries, 3);
    assert_eq!(config.upload.chunk_timeout(), Duration::from_secs(60));
    assert_eq!(config.finalize.attempts, 3);
    assert_eq!(config.credentials.store, CredentialStoreKind::File);
    assert!(config.receiver.auth_token.is_none());
}

#[test]
fn full_document_overrides_every_section() {
    let raw = r#"
[remote]
base_url = "https://files.example.com/"
api_prefix = "/cloud/api/"

[upload]
chunk_size_bytes = 1048576
concurrency = 8
max_retries = 5
chunk_timeout_seconds = 10

[upload.backoff]
base_ms = 100
factor = 3
max_ms = 900

[finalize]
attempts = 2
delay_ms = 50
timeout_ms = 2500

[credentials]
store = "memory"

[receiver]
bind = "0.0.0.0:9000"
storage_root = "/srv/files"
auth_token = "secret"
staging_ttl_seconds = 600
receipt_ttl_seconds = 3600
"#;
    let config = GlobalConfig::from_toml_str(raw).expect("valid config");
    assert_eq!(config.remote.api_root(), "https://files.example.com/cloud/api");
    assert_eq!(config.upload.chunk_size_bytes, 1_048_576);
    assert_eq!(config.upload.concurrency, 8);
    assert_eq!(config.upload.backoff.factor, 3);
    assert_eq!(config.finalize.delay_ms, 50);
    assert_eq!(config.finalize.timeout(), Duration::from_millis(2500));
    assert_eq!(config.credentials.store, CredentialStoreKind::Memory);
    assert_eq!(config.receiver.bind, "0.0.0.0:9000");
    assert_eq!(config.receiver.auth_token.as_deref(), Some("secret"));
    assert_eq!(config.receiver.staging_ttl(), Duration::from_secs(600));
    assert_eq!(config.receiver.receipt_ttl(), Duration::from_secs(3600));
    assert_eq!(config.receiver.sweep_interval(), Duration::from_secs(3600));
}

#[test]
fn validation_rejects_bad_values() {
    let cases = [
        ("[remote]\nbase_url = \"ftp://host\"", "base_url"),
        ("[remote]\napi_prefix = \"cloud\"", "api_prefix"),
        ("[upload]\nchunk_size_bytes = 0", "chunk_size_bytes"),
        ("[upload]\nconcurrency = 0", "concurrency"),
        ("[upload]\nmax_retries = 0", "max_retries"),
        ("[upload]\nchunk_timeout_seconds = 0", "chunk_timeout_seconds"),
        ("[upload.backoff]\nfactor = 0", "factor"),
        ("[finalize]\nattempts = 0", "attempts"),
        ("[receiver]\nmax_body_bytes = 0", "max_body_bytes"),
        ("[finalize]\ntimeout_ms = 0", "timeout_ms"),
        ("[receiver]\nsweep_interval_seconds = 0", "sweep_interval_seconds"),
    ];
    for (raw, field) in cases {
        let err = GlobalConfig::from_toml_str(raw).expect_err(field);
        match err {
            AppError::Config(msg) => assert!(msg.contains(field), "{msg} should name {field}"),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}

#[test]
fn malformed_toml_is_config_error() {
    let err = GlobalConfig::from_toml_str("[upload\nconcurrency = ").expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn unknown_credential_store_is_rejected() {
    let err = GlobalConfig::from_toml_str("[credentials]\nstore = \"vault\"").expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[upload]\nconcurrency = 2\n").expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.upload.concurrency, 2);

    let missing = GlobalConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(missing, Err(AppError::Config(_))));
}
