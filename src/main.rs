#![forbid(unsafe_code)]

//! `pincerna-upload`: chunked file uploader and reference receiver.
//!
//! `upload` sends a local file to the remote file API in parallel chunks and
//! requests assembly; `serve` runs the matching receiver; `login` and
//! `logout` manage the stored bearer token.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pincerna_uploader::credentials::{store_from_config, Credentials};
use pincerna_uploader::orchestrator::coordinator::UploadCoordinator;
use pincerna_uploader::orchestrator::events::UploadEvent;
use pincerna_uploader::receiver;
use pincerna_uploader::source::FileSource;
use pincerna_uploader::transport::http::HttpTransport;
use pincerna_uploader::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pincerna-upload", about = "Chunked file uploader", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a file in chunks and finalize it remotely.
    Upload {
        /// Local file to send.
        file: PathBuf,
        /// Remote destination directory.
        #[arg(long, default_value = "/")]
        dest: String,
        /// Remote file name; defaults to the local file name.
        #[arg(long)]
        name: Option<String>,
        /// Override `upload.chunk_size_bytes`.
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Override `upload.concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run the reference receiver.
    Serve {
        /// Override `receiver.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Override `receiver.storage_root`.
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Save a bearer token to the configured store.
    Login {
        /// Token issued by the remote.
        #[arg(long)]
        token: String,
    },
    /// Remove the stored token.
    Logout,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };

    match args.command {
        Command::Upload {
            file,
            dest,
            name,
            chunk_size,
            concurrency,
        } => {
            if let Some(chunk_size) = chunk_size {
                config.upload.chunk_size_bytes = chunk_size;
            }
            if let Some(concurrency) = concurrency {
                config.upload.concurrency = concurrency;
            }
            config.validate()?;
            upload(&config, &file, &dest, name).await
        }
        Command::Serve { bind, root } => {
            if let Some(bind) = bind {
                config.receiver.bind = bind;
            }
            if let Some(root) = root {
                config.receiver.storage_root = root;
            }
            config.validate()?;
            serve(&config).await
        }
        Command::Login { token } => {
            let token = token.trim();
            if token.is_empty() {
                return Err(AppError::InvalidInput("token must not be empty".into()));
            }
            store_from_config(&config.credentials).save(token)?;
            info!(store = ?config.credentials.store, "token saved");
            Ok(())
        }
        Command::Logout => {
            store_from_config(&config.credentials).clear()?;
            info!(store = ?config.credentials.store, "token removed");
            Ok(())
        }
    }
}

async fn upload(
    config: &GlobalConfig,
    file: &Path,
    dest: &str,
    name: Option<String>,
) -> Result<()> {
    let file_name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::InvalidInput(format!("{} has no file name", file.display())))?,
    };

    let credentials = Arc::new(Credentials::load(store_from_config(&config.credentials)));
    if credentials.token().is_none() {
        warn!("no token available; requests will be sent unauthenticated");
    }
    let transport = Arc::new(HttpTransport::new(&config.remote, credentials));
    let coordinator = UploadCoordinator::from_config(config, transport);
    let source = Arc::new(FileSource::open(file).await?);

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        info!("interrupt received; cancelling upload");
        signal_ct.cancel();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let log_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
        }
    });

    let result = coordinator
        .upload(source, &file_name, dest, &ct, Some(&tx))
        .await;
    drop(tx);
    let _ = log_handle.await;
    signal_handle.abort();

    let report = result?;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::InvalidInput(format!("failed to render receipt: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn log_event(event: &UploadEvent) {
    match event {
        UploadEvent::ChunkAcked {
            session_id,
            index,
            progress,
        } => info!(
            %session_id,
            index,
            percent = progress.percent,
            uploaded_bytes = progress.uploaded_bytes,
            total_bytes = progress.total_bytes,
            "progress"
        ),
        UploadEvent::ChunkRetrying {
            session_id,
            index,
            attempt,
            delay,
            error,
        } => warn!(%session_id, index, attempt, ?delay, %error, "retrying chunk"),
        UploadEvent::Finalizing { session_id } => info!(%session_id, "finalizing"),
        UploadEvent::Completed {
            session_id,
            receipt,
        } => info!(
            %session_id,
            path = receipt.path.as_deref().unwrap_or_default(),
            "completed"
        ),
        UploadEvent::Failed { session_id, error } => error!(%session_id, %error, "failed"),
        UploadEvent::Cancelled { session_id } => warn!(%session_id, "cancelled"),
    }
}

async fn serve(config: &GlobalConfig) -> Result<()> {
    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    receiver::serve(&config.receiver, &config.remote.api_prefix, ct).await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
