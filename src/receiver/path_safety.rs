//! Destination validation for the receiver.
//!
//! Client-supplied directories are resolved inside the storage root: a
//! leading `/` means the root itself, `..` may not climb above it, the
//! staging area is off limits, and symlinks may not lead outside.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Resolve `candidate` relative to `storage_root`.
///
/// Walks the normalized components from the root, resolving every existing
/// symlink on the way, so a link anywhere in the chain is caught even when
/// the final entry does not exist yet.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if:
/// - The storage root cannot be canonicalized.
/// - `..` segments escape the root.
/// - A component names the staging area.
/// - A symlink along the path resolves outside the root.
pub fn validate_path(storage_root: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let root = storage_root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("storage root invalid: {err}")))?;

    let mut resolved = root.clone();
    for part in normalize(candidate.as_ref())? {
        resolved.push(part);
        match resolved.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                resolved = resolved.canonicalize().map_err(|err| {
                    AppError::PathViolation(format!("cannot resolve link: {err}"))
                })?;
                if !resolved.starts_with(&root) {
                    return Err(AppError::PathViolation(
                        "symlink target escapes storage root".into(),
                    ));
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::PathViolation(format!(
                    "cannot inspect {}: {err}",
                    resolved.display()
                )));
            }
        }
    }
    Ok(resolved)
}

/// Components of `candidate` after applying `.` and `..`. A root or
/// prefix restarts at the storage root.
fn normalize(candidate: &Path) -> Result<Vec<&OsStr>> {
    let mut parts = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) if part == STAGING_DIR => {
                return Err(AppError::PathViolation("staging area is reserved".into()));
            }
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(AppError::PathViolation(
                        "path attempts to escape storage root".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => parts.clear(),
        }
    }
    Ok(parts)
}

/// Resolve the final location of `file_name` inside directory `path`.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the file name is not a single
/// ordinary component or the directory fails [`validate_path`].
pub fn resolve_destination(storage_root: &Path, path: &str, file_name: &str) -> Result<PathBuf> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name != STAGING_DIR => {}
        _ => {
            return Err(AppError::PathViolation(format!(
                "invalid file name: {file_name:?}"
            )));
        }
    }
    Ok(validate_path(storage_root, path)?.join(file_name))
}

/// Reject upload ids that could not safely name a staging directory.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` unless the id is non-empty and made of
/// ASCII alphanumerics, `-` and `_`.
pub fn validate_upload_id(upload_id: &str) -> Result<()> {
    let valid = !upload_id.is_empty()
        && upload_id.len() <= 128
        && upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "invalid upload id: {upload_id:?}"
        )))
    }
}

/// Directory under the storage root that holds in-progress uploads.
pub const STAGING_DIR: &str = ".staging";
