//! Byte sources that chunk descriptors index into.

use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::models::chunk::ChunkDescriptor;
use crate::{AppError, Result};

/// Random-access byte source for one upload.
pub trait ChunkSource: Send + Sync {
    /// Total number of bytes in the source.
    fn len(&self) -> u64;

    /// Whether the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly the bytes covered by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the range cannot be read in full.
    fn read<'a>(
        &'a self,
        descriptor: &'a ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>>;
}

/// Source backed by an in-memory buffer. Reads are zero-copy slices.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    /// Wrap `data`.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read<'a>(
        &'a self,
        descriptor: &'a ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let start = usize::try_from(descriptor.byte_start)
                .map_err(|err| AppError::Io(format!("chunk start out of range: {err}")))?;
            let end = usize::try_from(descriptor.byte_end)
                .map_err(|err| AppError::Io(format!("chunk end out of range: {err}")))?;
            if start > end || end > self.data.len() {
                return Err(AppError::Io(format!(
                    "chunk {} [{start}, {end}) outside {} byte buffer",
                    descriptor.index,
                    self.data.len()
                )));
            }
            Ok(self.data.slice(start..end))
        })
    }
}

/// Source backed by a file on disk. Each read opens its own handle so
/// concurrent chunk reads never share a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Stat `path` and record its length.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be inspected or is not a
    /// regular file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| AppError::Io(format!("cannot stat {}: {err}", path.display())))?;
        if !metadata.is_file() {
            return Err(AppError::Io(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            path,
            len: metadata.len(),
        })
    }

    /// Path the source reads from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read<'a>(
        &'a self,
        descriptor: &'a ChunkDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let io_err = |err: std::io::Error| {
                AppError::Io(format!(
                    "read chunk {} of {}: {err}",
                    descriptor.index,
                    self.path.display()
                ))
            };
            if descriptor.byte_start > descriptor.byte_end || descriptor.byte_end > self.len {
                return Err(AppError::Io(format!(
                    "chunk {} [{}, {}) outside {} byte file",
                    descriptor.index, descriptor.byte_start, descriptor.byte_end, self.len
                )));
            }
            let length = usize::try_from(descriptor.len())
                .map_err(|err| AppError::Io(format!("chunk too large: {err}")))?;
            let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
            file.seek(SeekFrom::Start(descriptor.byte_start))
                .await
                .map_err(io_err)?;
            let mut buf = vec![0_u8; length];
            file.read_exact(&mut buf).await.map_err(io_err)?;
            Ok(Bytes::from(buf))
        })
    }
}
