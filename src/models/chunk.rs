//! Chunk descriptors and the slicer that derives them.

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Immutable byte range of one chunk within a session's file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChunkDescriptor {
    /// Owning session.
    pub session_id: String,
    /// Zero-based chunk index, stable for the session lifetime.
    pub index: usize,
    /// Inclusive start offset.
    pub byte_start: u64,
    /// Exclusive end offset.
    pub byte_end: u64,
    /// Whether this is the final chunk of the file.
    pub is_last: bool,
}

impl ChunkDescriptor {
    /// Number of bytes covered by this chunk; zero for an inverted range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.byte_end.saturating_sub(self.byte_start)
    }

    /// Whether the range is empty. Never true for slicer output.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.byte_end <= self.byte_start
    }
}

/// Splits `total_bytes` into contiguous `chunk_size` ranges.
///
/// The slicer itself holds no cursor; every call to [`iter`](Self::iter)
/// starts again from index zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlicer {
    session_id: String,
    total_bytes: u64,
    chunk_size: u64,
    total_chunks: usize,
}

impl ChunkSlicer {
    /// Build a slicer for a file of `total_bytes`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` if `chunk_size` is zero or the
    /// chunk count does not fit in `usize`.
    pub fn new(session_id: impl Into<String>, total_bytes: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(AppError::InvalidInput(
                "chunk size must be greater than zero".into(),
            ));
        }
        let total_chunks = usize::try_from(total_bytes.div_ceil(chunk_size)).map_err(|_| {
            AppError::InvalidInput(format!(
                "{total_bytes} bytes at {chunk_size} bytes per chunk exceeds addressable chunks"
            ))
        })?;
        Ok(Self {
            session_id: session_id.into(),
            total_bytes,
            chunk_size,
            total_chunks,
        })
    }

    /// Number of descriptors the slicer yields.
    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Descriptor for `index`, or `None` past the end.
    #[must_use]
    pub fn descriptor(&self, index: usize) -> Option<ChunkDescriptor> {
        if index >= self.total_chunks {
            return None;
        }
        let byte_start = self.chunk_size * index as u64;
        let byte_end = (byte_start + self.chunk_size).min(self.total_bytes);
        Some(ChunkDescriptor {
            session_id: self.session_id.clone(),
            index,
            byte_start,
            byte_end,
            is_last: index + 1 == self.total_chunks,
        })
    }

    /// Lazily enumerate all descriptors in index order.
    #[must_use]
    pub fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            slicer: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a ChunkSlicer {
    type Item = ChunkDescriptor;
    type IntoIter = ChunkIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`ChunkSlicer::iter`].
#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    slicer: &'a ChunkSlicer,
    next: usize,
}

impl Iterator for ChunkIter<'_> {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let descriptor = self.slicer.descriptor(self.next)?;
        self.next += 1;
        Some(descriptor)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.slicer.total_chunks.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter<'_> {}
