//! Inclusion proofs: the sibling hashes from a leaf to the root, which
//! let a third party check a chunk against the root without holding the
//! whole tree.

use mirror_primitives::{Digest, Shape};

use crate::engine::node_digest;
use crate::error::TreeError;

/// Which side of the running hash the sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: Side,
}

/// Folds a leaf digest through a proof, yielding the root it implies.
pub fn verify_path(leaf: &Digest, proof: &[ProofStep]) -> Digest {
    let mut acc = *leaf;
    for step in proof {
        acc = match step.side {
            Side::Left => node_digest(&step.sibling, &acc),
            Side::Right => node_digest(&acc, &step.sibling),
        };
    }
    acc
}

/// Builds the proof for leaf `k` out of a complete node array.
pub(crate) fn path_proof_from_nodes(
    shape: &Shape,
    nodes: &[Digest],
    k: u64,
) -> Result<Vec<ProofStep>, TreeError> {
    if k >= shape.leaf_count() {
        return Err(TreeError::LeafOutOfRange {
            leaf: k,
            leaf_count: shape.leaf_count(),
        });
    }

    let mut proof = Vec::new();
    let mut node = shape.node_index(k);
    while shape.parent(node).is_some() {
        let sibling = shape.sibling(node).expect("non-root node has a sibling");
        let side = if sibling < node {
            Side::Left
        } else {
            Side::Right
        };
        proof.push(ProofStep {
            sibling: nodes[sibling as usize],
            side,
        });
        node = shape.parent(node).expect("checked above");
    }

    Ok(proof)
}
