//! Deterministic hashing of chunks and tree nodes.
//!
//! Leaves are the bare SHA-256 of the chunk bytes, with no length
//! prefix or domain separation. Internal nodes are the SHA-256 of the
//! two child hashes concatenated left-then-right. The heap-arranged
//! array is complete (`2 * leaf_count - 1` nodes), so every internal
//! node has both children materialized; a combiner that pads a missing
//! right sibling with a copy of the left one produces the same array.

use mirror_primitives::{Digest, Shape};
use sha2::{Digest as _, Sha256};

use crate::error::TreeError;

/// Hash of a single chunk. For a short final chunk the digest covers
/// exactly its actual byte length.
pub fn leaf_digest(bytes: &[u8]) -> Digest {
    Digest::new(bytes)
}

/// Hash of an internal node from its two children.
pub fn node_digest(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest::from_bytes(hasher.finalize().into())
}

/// Builds the full heap-ordered node array from the leaf digests,
/// combining bottom-up.
pub fn build_nodes(shape: &Shape, leaves: Vec<Digest>) -> Result<Vec<Digest>, TreeError> {
    if leaves.len() as u64 != shape.leaf_count() {
        return Err(TreeError::ShapeMismatch(format!(
            "expected {} leaf digests, got {}",
            shape.leaf_count(),
            leaves.len()
        )));
    }

    let node_count = shape.node_count() as usize;
    let first_leaf = shape.first_leaf_index() as usize;

    let mut nodes = vec![Digest::from_bytes([0; 32]); node_count];
    nodes[first_leaf..].copy_from_slice(&leaves);

    for i in (0..first_leaf).rev() {
        let (left, right) = shape
            .children(i as u64)
            .expect("index below the leaf offset is internal");
        nodes[i] = node_digest(&nodes[left as usize], &nodes[right as usize]);
    }

    Ok(nodes)
}

/// Digests every chunk of `source`, in leaf order.
pub fn leaf_digests(shape: &Shape, source: &[u8]) -> Result<Vec<Digest>, TreeError> {
    if source.len() as u64 != shape.total_content_size() {
        return Err(TreeError::ShapeMismatch(format!(
            "source is {} bytes, shape says {}",
            source.len(),
            shape.total_content_size()
        )));
    }

    let mut leaves = Vec::with_capacity(shape.leaf_count() as usize);
    for k in 0..shape.leaf_count() {
        let (start, end) = shape.chunk_range(k);
        leaves.push(leaf_digest(&source[start as usize..end as usize]));
    }
    Ok(leaves)
}
