//! On-disk staging of received chunks and final assembly.
//!
//! Layout: `<root>/.staging/<upload_id>/manifest.json` plus one
//! `<index>.part` file per received chunk. Receipts of finalized uploads
//! live in `<root>/.staging/.receipts/<upload_id>.json`; upload ids cannot
//! start with a dot, so the two never collide. Every write goes through a
//! temporary file in the same directory followed by a rename, so a part is
//! either absent or complete. These functions block; the router calls them
//! from `spawn_blocking`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::path_safety::STAGING_DIR;
use crate::transport::FinalizeReceipt;
use crate::{AppError, Result};

const MANIFEST_FILE: &str = "manifest.json";
const RECEIPTS_DIR: &str = ".receipts";

/// What the first chunk of an upload declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Name of the assembled file.
    pub filename: String,
    /// Destination directory relative to the storage root.
    pub path: String,
    /// Number of chunks the upload consists of.
    pub total: usize,
}

/// Assembled file details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Bytes written.
    pub size: u64,
    /// Hex SHA-256 of the file.
    pub sha256: String,
}

/// Staging area rooted under a storage directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Staging area for `storage_root`.
    #[must_use]
    pub fn new(storage_root: &Path) -> Self {
        Self {
            root: storage_root.join(STAGING_DIR),
        }
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    fn part_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.upload_dir(upload_id).join(format!("{index}.part"))
    }

    fn receipts_dir(&self) -> PathBuf {
        self.root.join(RECEIPTS_DIR)
    }

    fn receipt_path(&self, upload_id: &str) -> PathBuf {
        self.receipts_dir().join(format!("{upload_id}.json"))
    }

    /// Store chunk `index`, replacing any earlier copy.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on filesystem failure.
    pub fn write_part(&self, upload_id: &str, index: usize, data: &[u8]) -> Result<()> {
        write_atomic(&self.part_path(upload_id, index), data)
    }

    /// Manifest recorded for `upload_id`, if any chunk has arrived.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the manifest exists but cannot be read.
    pub fn read_manifest(&self, upload_id: &str) -> Result<Option<Manifest>> {
        let path = self.upload_dir(upload_id).join(MANIFEST_FILE);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read manifest", &path, &err)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|err| AppError::Io(format!("corrupt manifest {}: {err}", path.display())))
    }

    /// Persist `manifest` for `upload_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on filesystem failure.
    pub fn write_manifest(&self, upload_id: &str, manifest: &Manifest) -> Result<()> {
        let body = serde_json::to_vec(manifest)
            .map_err(|err| AppError::Io(format!("failed to encode manifest: {err}")))?;
        write_atomic(&self.upload_dir(upload_id).join(MANIFEST_FILE), &body)
    }

    /// Indices in `0..total` with no stored part.
    #[must_use]
    pub fn missing_parts(&self, upload_id: &str, total: usize) -> Vec<usize> {
        (0..total)
            .filter(|&index| !self.part_path(upload_id, index).is_file())
            .collect()
    }

    /// Concatenate parts `0..total` into `destination` and hash the result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a part cannot be read or the destination
    /// cannot be written.
    pub fn assemble(&self, upload_id: &str, total: usize, destination: &Path) -> Result<Assembled> {
        let parent = destination
            .parent()
            .ok_or_else(|| AppError::Io("destination has no parent directory".into()))?;
        fs::create_dir_all(parent).map_err(|err| io_error("create directory", parent, &err))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
        let mut hasher = Sha256::new();
        let mut size = 0_u64;
        for index in 0..total {
            let part = self.part_path(upload_id, index);
            let data = fs::read(&part).map_err(|err| io_error("read part", &part, &err))?;
            hasher.update(&data);
            tmp.write_all(&data)
                .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
            size += data.len() as u64;
        }
        tmp.persist(destination)
            .map_err(|err| io_error("persist", destination, &err.error))?;

        Ok(Assembled {
            size,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    /// Receipt recorded when `upload_id` was finalized.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the receipt exists but cannot be read.
    pub fn read_receipt(&self, upload_id: &str) -> Result<Option<FinalizeReceipt>> {
        let path = self.receipt_path(upload_id);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read receipt", &path, &err)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|err| AppError::Io(format!("corrupt receipt {}: {err}", path.display())))
    }

    /// Record the receipt of a finalized upload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on filesystem failure.
    pub fn write_receipt(&self, upload_id: &str, receipt: &FinalizeReceipt) -> Result<()> {
        let body = serde_json::to_vec(receipt)
            .map_err(|err| AppError::Io(format!("failed to encode receipt: {err}")))?;
        write_atomic(&self.receipt_path(upload_id), &body)
    }

    /// Last time anything was staged for `upload_id`, or `None` if nothing is.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the upload directory cannot be inspected.
    pub fn last_activity(&self, upload_id: &str) -> Result<Option<SystemTime>> {
        let dir = self.upload_dir(upload_id);
        match fs::metadata(&dir).and_then(|meta| meta.modified()) {
            Ok(modified) => Ok(Some(modified)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("inspect", &dir, &err)),
        }
    }

    /// Upload ids with no staging activity since `cutoff`, sorted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the staging directory cannot be listed.
    pub fn idle_uploads(&self, cutoff: SystemTime) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("list", &self.root, &err)),
        };
        let mut idle = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error("list", &self.root, &err))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|err| io_error("inspect", &path, &err))?;
            if !meta.is_dir() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(|err| io_error("inspect", &path, &err))?;
            if modified < cutoff {
                idle.push(name);
            }
        }
        idle.sort();
        Ok(idle)
    }

    /// Delete receipts recorded before `cutoff`; returns how many went.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the receipts cannot be listed or removed.
    pub fn expire_receipts(&self, cutoff: SystemTime) -> Result<usize> {
        let dir = self.receipts_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_error("list", &dir, &err)),
        };
        let mut expired = 0;
        for entry in entries {
            let entry = entry.map_err(|err| io_error("list", &dir, &err))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map_err(|err| io_error("inspect", &path, &err))?;
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => expired += 1,
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(io_error("remove receipt", &path, &err)),
                }
            }
        }
        Ok(expired)
    }

    /// Delete everything staged for `upload_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory exists but cannot be removed.
    pub fn remove(&self, upload_id: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove staging", &dir, &err)),
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).map_err(|err| io_error("create directory", parent, &err))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(data)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.persist(path)
        .map_err(|err| io_error("persist", path, &err.error))?;
    Ok(())
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> AppError {
    AppError::Io(format!("failed to {action} {}: {err}", path.display()))
}
