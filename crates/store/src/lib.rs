//! The local data file: a sparse, full-size copy of the remote
//! artifact with random-access reads and per-chunk positional writes.
//!
//! Bytes of chunks that have not been accepted yet are unspecified
//! (zero on a fresh file). Callers gate reads on the state tree's
//! validity bitmap; the store itself does no caching beyond the OS
//! page cache.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt as _;

use camino::{Utf8Path, Utf8PathBuf};
use mirror_primitives::Shape;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("chunk store i/o failed")]
    Io(#[from] io::Error),

    #[error("store file is {actual} bytes, shape says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("chunk {leaf} out of range for {leaf_count} chunks")]
    OutOfRange { leaf: u64, leaf_count: u64 },

    #[error("chunk {leaf} is {expected} bytes, got {got}")]
    ChunkLength { leaf: u64, expected: u64, got: u64 },
}

#[derive(Debug)]
pub struct ChunkStore {
    file: fs::File,
    shape: Shape,
    path: Utf8PathBuf,
}

impl ChunkStore {
    /// Creates the file and extends it to the full content size. The
    /// extension is sparse where the filesystem supports it.
    pub fn create(path: &Utf8Path, shape: Shape) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_std_path())?;
        file.set_len(shape.total_content_size())?;
        debug!(%path, size = %shape.total_content_size(), "Allocated chunk store");

        Ok(Self {
            file,
            shape,
            path: path.to_owned(),
        })
    }

    /// Opens an existing store, insisting on the exact size.
    pub fn open(path: &Utf8Path, shape: Shape) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_std_path())?;

        let actual = file.metadata()?.len();
        if actual != shape.total_content_size() {
            return Err(StoreError::SizeMismatch {
                expected: shape.total_content_size(),
                actual,
            });
        }

        Ok(Self {
            file,
            shape,
            path: path.to_owned(),
        })
    }

    pub fn open_or_create(path: &Utf8Path, shape: Shape) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path, shape)
        } else {
            Self::create(path, shape)
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.shape.total_content_size()
    }

    /// Reads `[lo, min(hi, total))`. Past the end of content the result
    /// is empty.
    pub fn read(&self, lo: u64, hi: u64) -> Result<Vec<u8>, StoreError> {
        let hi = hi.min(self.total_size());
        if lo >= hi {
            return Ok(Vec::new());
        }

        let mut buf = vec![0_u8; (hi - lo) as usize];
        self.file.read_exact_at(&mut buf, lo)?;
        Ok(buf)
    }

    /// Fills `buf` from `offset`, returning how many bytes were read.
    /// Zero at or past end of content.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        if offset >= self.total_size() {
            return Ok(0);
        }

        let len = (buf.len() as u64).min(self.total_size() - offset) as usize;
        self.file.read_exact_at(&mut buf[..len], offset)?;
        Ok(len)
    }

    /// Positional write of exactly chunk `k`'s bytes, synced to disk
    /// before returning so a set valid bit never outlives the data.
    pub fn write_chunk(&self, k: u64, bytes: &[u8]) -> Result<(), StoreError> {
        if k >= self.shape.leaf_count() {
            return Err(StoreError::OutOfRange {
                leaf: k,
                leaf_count: self.shape.leaf_count(),
            });
        }
        let expected = self.shape.leaf_len(k);
        if bytes.len() as u64 != expected {
            return Err(StoreError::ChunkLength {
                leaf: k,
                expected,
                got: bytes.len() as u64,
            });
        }

        let (start, _) = self.shape.chunk_range(k);
        self.file.write_all_at(bytes, start)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.file.sync_all()?;
        Ok(())
    }
}
