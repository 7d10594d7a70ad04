use mirror_primitives::ShapeError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TreeError {
    #[error("corrupt tree file: {0}")]
    Corrupt(String),

    #[error("tree i/o failed")]
    Io(#[from] std::io::Error),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("node {index} out of range for tree of {node_count} nodes")]
    OutOfRange { index: u64, node_count: u64 },

    #[error("leaf {leaf} out of range for tree of {leaf_count} leaves")]
    LeafOutOfRange { leaf: u64, leaf_count: u64 },

    #[error("internal node {node} is not covered by valid leaves")]
    Unavailable { node: u64 },

    #[error("state tree has no backing file")]
    Detached,

    #[error(transparent)]
    Shape(#[from] ShapeError),
}
