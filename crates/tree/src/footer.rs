//! Fixed-layout trailer of a tree file.
//!
//! The footer sits at the very end of the file so a reader can locate
//! it without knowing anything else: read one byte at `EOF - 1`, treat
//! it as the footer length, then read that many bytes ending at EOF.
//! Multi-byte integers are big-endian.

use mirror_primitives::Shape;

use crate::error::TreeError;

/// chunk_size (8) + total_content_size (8) + leaf_count (8)
/// + bitmap_byte_len (4) + footer_length (1).
pub const FOOTER_LEN: usize = 29;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub chunk_size: u64,
    pub total_content_size: u64,
    pub leaf_count: u64,
    pub bitmap_byte_len: u32,
}

impl Footer {
    pub fn for_shape(shape: &Shape) -> Self {
        Self {
            chunk_size: shape.chunk_size(),
            total_content_size: shape.total_content_size(),
            leaf_count: shape.leaf_count(),
            bitmap_byte_len: bitmap_byte_len(shape.leaf_count()),
        }
    }

    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut out = [0_u8; FOOTER_LEN];
        out[0..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[8..16].copy_from_slice(&self.total_content_size.to_be_bytes());
        out[16..24].copy_from_slice(&self.leaf_count.to_be_bytes());
        out[24..28].copy_from_slice(&self.bitmap_byte_len.to_be_bytes());
        out[28] = FOOTER_LEN as u8;
        out
    }

    /// Parses the footer from the tail of a whole tree file.
    pub fn parse(file: &[u8]) -> Result<Self, TreeError> {
        let Some(&length_byte) = file.last() else {
            return Err(TreeError::Corrupt("file is empty".to_owned()));
        };

        if length_byte as usize != FOOTER_LEN {
            return Err(TreeError::Corrupt(format!(
                "footer length byte is {length_byte}, expected {FOOTER_LEN}"
            )));
        }
        if file.len() < FOOTER_LEN {
            return Err(TreeError::Corrupt(format!(
                "file is {} bytes, too short for a {FOOTER_LEN}-byte footer",
                file.len()
            )));
        }

        let footer = &file[file.len() - FOOTER_LEN..];
        let chunk_size = u64::from_be_bytes(footer[0..8].try_into().expect("8-byte slice"));
        let total_content_size = u64::from_be_bytes(footer[8..16].try_into().expect("8-byte slice"));
        let leaf_count = u64::from_be_bytes(footer[16..24].try_into().expect("8-byte slice"));
        let bitmap_byte_len = u32::from_be_bytes(footer[24..28].try_into().expect("4-byte slice"));

        Ok(Self {
            chunk_size,
            total_content_size,
            leaf_count,
            bitmap_byte_len,
        })
    }

    /// Reconstructs and cross-checks the shape this footer describes.
    pub fn shape(&self) -> Result<Shape, TreeError> {
        let shape = Shape::with_chunk_size(self.total_content_size, self.chunk_size)
            .map_err(|err| TreeError::Corrupt(format!("footer shape: {err}")))?;

        if shape.leaf_count() != self.leaf_count {
            return Err(TreeError::Corrupt(format!(
                "footer says {} leaves, shape derives {}",
                self.leaf_count,
                shape.leaf_count()
            )));
        }
        if self.bitmap_byte_len != bitmap_byte_len(self.leaf_count) {
            return Err(TreeError::Corrupt(format!(
                "footer says {} bitmap bytes, {} leaves need {}",
                self.bitmap_byte_len,
                self.leaf_count,
                bitmap_byte_len(self.leaf_count)
            )));
        }

        Ok(shape)
    }
}

/// Bitmap region size for a leaf count: packed `u64` words, one bit per
/// leaf.
pub fn bitmap_byte_len(leaf_count: u64) -> u32 {
    (leaf_count.div_ceil(64) * 8) as u32
}
