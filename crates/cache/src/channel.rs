//! The verified read surface: every read blocks until the chunks it
//! touches are materialized and verified, then serves bytes straight
//! from the local store.

use std::fmt;
use std::sync::Arc;

use mirror_store::ChunkStore;

use crate::error::ChannelError;
use crate::manager::TransferManager;

pub struct MirrorChannel {
    manager: TransferManager,
    store: Arc<ChunkStore>,
}

impl fmt::Debug for MirrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorChannel")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl MirrorChannel {
    pub fn new(manager: TransferManager, store: Arc<ChunkStore>) -> Self {
        Self { manager, store }
    }

    /// Total content size. Constant for the lifetime of the channel.
    pub fn size(&self) -> u64 {
        self.store.total_size()
    }

    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    /// Fills `buf` from `offset`, materializing whatever the range
    /// needs first. Returns the number of bytes read; zero at or past
    /// end of content.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ChannelError> {
        if buf.is_empty() || offset >= self.size() {
            return Ok(0);
        }

        let hi = offset.saturating_add(buf.len() as u64);
        self.manager.observe_read(offset, hi);
        self.manager.ensure_range(offset, hi).await?;

        Ok(self.store.read_into(offset, buf)?)
    }

    /// Owned-buffer variant of [`MirrorChannel::read_at`] covering
    /// `[lo, min(hi, size))`.
    pub async fn read_range(&self, lo: u64, hi: u64) -> Result<Vec<u8>, ChannelError> {
        let hi = hi.min(self.size());
        if lo >= hi {
            return Ok(Vec::new());
        }

        self.manager.observe_read(lo, hi);
        self.manager.ensure_range(lo, hi).await?;

        Ok(self.store.read(lo, hi)?)
    }

    /// Materializes `[offset, offset + len)` without copying anything
    /// out. A hint for callers that know what they are about to read.
    pub async fn prebuffer(&self, offset: u64, len: u64) -> Result<(), ChannelError> {
        let hi = offset.saturating_add(len);
        Ok(self.manager.ensure_range(offset, hi).await?)
    }

    /// The channel is strictly a read surface.
    pub fn write_at(&self, _offset: u64, _bytes: &[u8]) -> Result<usize, ChannelError> {
        Err(ChannelError::Unsupported)
    }

    pub fn set_len(&self, _len: u64) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported)
    }

    pub fn try_lock(&self) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported)
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }
}
