//! On-disk Merkle trees over chunked artifacts.
//!
//! A tree file is a heap-ordered hash array, a per-leaf validity
//! bitmap, and a self-describing footer. Two roles share the format: a
//! [`ReferenceTree`] (all leaves known and trusted, immutable) and a
//! [`StateTree`] (leaves filled in as verified chunks arrive).

use camino::Utf8Path;
use mirror_primitives::{Digest, Shape};

pub mod bitmap;
pub mod engine;
mod error;
pub mod footer;
mod image;
pub mod proof;
mod reference;
mod state;

pub use error::TreeError;
pub use proof::{verify_path, ProofStep, Side};
pub use reference::ReferenceTree;
pub use state::StateTree;

/// Conventional extension for reference tree files.
pub const REFERENCE_EXT: &str = "mref";

/// Conventional extension for state tree files.
pub const STATE_EXT: &str = "mrkl";

/// Read surface shared by both tree roles.
pub trait TreeRead {
    fn shape(&self) -> Shape;
    fn hash_of_leaf(&self, k: u64) -> Result<Digest, TreeError>;
}

impl TreeRead for ReferenceTree {
    fn shape(&self) -> Shape {
        self.shape()
    }

    fn hash_of_leaf(&self, k: u64) -> Result<Digest, TreeError> {
        self.hash_of_leaf(k)
    }
}

impl TreeRead for StateTree {
    fn shape(&self) -> Shape {
        self.shape()
    }

    fn hash_of_leaf(&self, k: u64) -> Result<Digest, TreeError> {
        self.hash_of_leaf(k)
    }
}

/// A tree file of either role, classified by bitmap density on load: a
/// fully-set bitmap is a reference, anything else is in-progress state.
#[derive(Debug)]
pub enum Tree {
    Reference(ReferenceTree),
    State(StateTree),
}

impl Tree {
    pub fn load(path: &Utf8Path) -> Result<Self, TreeError> {
        let image = image::read_image(path)?;
        if image.bitmap.is_full() {
            return Ok(Self::Reference(ReferenceTree::from_parts(
                image.shape,
                image.nodes,
            )));
        }
        let state = StateTree::from_image(image);
        state.attach(path)?;
        Ok(Self::State(state))
    }
}

/// Walks `leaf_range` (inclusive) on both trees, returning the leaves
/// whose hashes differ. Diagnostic surface for resync.
pub fn find_mismatched_leaves(
    a: &dyn TreeRead,
    b: &dyn TreeRead,
    leaf_range: (u64, u64),
) -> Result<Vec<u64>, TreeError> {
    if a.shape() != b.shape() {
        return Err(TreeError::ShapeMismatch(format!(
            "trees disagree on geometry: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }

    let (from, to) = leaf_range;
    let mut mismatched = Vec::new();
    for k in from..=to {
        if a.hash_of_leaf(k)? != b.hash_of_leaf(k)? {
            mismatched.push(k);
        }
    }
    Ok(mismatched)
}
