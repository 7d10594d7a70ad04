//! Whole-file serialization of a tree: hash region, bitmap region,
//! footer. Shared by the reference and state variants.

use std::fs;
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use mirror_primitives::{Digest, Shape, DIGEST_SIZE};
use tracing::warn;

use crate::bitmap::Bitmap;
use crate::error::TreeError;
use crate::footer::{Footer, FOOTER_LEN};

pub(crate) struct TreeImage {
    pub shape: Shape,
    pub nodes: Vec<Digest>,
    pub bitmap: Bitmap,
}

/// Reads and validates a tree file in one pass.
pub(crate) fn read_image(path: &Utf8Path) -> Result<TreeImage, TreeError> {
    let bytes = fs::read(path)?;
    parse_image(&bytes)
}

/// Validates serialized tree-file bytes, wherever they came from.
pub(crate) fn parse_image(bytes: &[u8]) -> Result<TreeImage, TreeError> {
    let footer = Footer::parse(bytes)?;
    let shape = footer.shape()?;

    let regions_len = bytes.len() - FOOTER_LEN;
    let bitmap_len = footer.bitmap_byte_len as usize;
    let Some(hash_len) = regions_len.checked_sub(bitmap_len) else {
        return Err(TreeError::Corrupt(format!(
            "file has {regions_len} region bytes, footer claims a {bitmap_len}-byte bitmap"
        )));
    };

    if hash_len % DIGEST_SIZE != 0 {
        return Err(TreeError::Corrupt(format!(
            "hash region is {hash_len} bytes, not a multiple of {DIGEST_SIZE}"
        )));
    }
    if (hash_len / DIGEST_SIZE) as u64 != shape.node_count() {
        return Err(TreeError::Corrupt(format!(
            "hash region holds {} nodes, shape needs {}",
            hash_len / DIGEST_SIZE,
            shape.node_count()
        )));
    }

    let nodes = bytes[..hash_len]
        .chunks_exact(DIGEST_SIZE)
        .map(|raw| Digest::from_bytes(raw.try_into().expect("32-byte chunk")))
        .collect();
    let bitmap = Bitmap::from_bytes(&bytes[hash_len..hash_len + bitmap_len], shape.leaf_count())?;

    Ok(TreeImage {
        shape,
        nodes,
        bitmap,
    })
}

/// Writes a tree file atomically: temp file, fsync, rename. A failed
/// write leaves the destination untouched and parks the partial bytes
/// in a `.corrupted` sidecar for inspection.
pub(crate) fn write_image(
    path: &Utf8Path,
    shape: &Shape,
    nodes: &[Digest],
    bitmap_bytes: &[u8],
) -> Result<(), TreeError> {
    debug_assert_eq!(nodes.len() as u64, shape.node_count());

    let mut buf =
        Vec::with_capacity(nodes.len() * DIGEST_SIZE + bitmap_bytes.len() + FOOTER_LEN);
    for node in nodes {
        buf.extend_from_slice(node.as_bytes());
    }
    buf.extend_from_slice(bitmap_bytes);
    buf.extend_from_slice(&Footer::for_shape(shape).encode());

    let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(&buf)?;
            file.sync_all()
        })
        .map_err(TreeError::Io);

    match written {
        Ok(()) => {
            fs::rename(&tmp, path)?;
            Ok(())
        }
        Err(err) => {
            let sidecar = corrupted_path(path);
            if fs::rename(&tmp, &sidecar).is_ok() {
                warn!(%path, %sidecar, "Partial tree write parked in sidecar");
            }
            Err(err)
        }
    }
}

pub(crate) fn corrupted_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.corrupted"))
}

/// Moves an unreadable tree file aside so a rebuild does not destroy
/// the evidence.
pub(crate) fn quarantine(path: &Utf8Path) -> Result<(), TreeError> {
    let sidecar = corrupted_path(path);
    fs::rename(path, &sidecar)?;
    warn!(%path, %sidecar, "Corrupt tree file moved aside");
    Ok(())
}
