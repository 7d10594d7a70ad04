use std::sync::Arc;

use mirror_store::StoreError;
use mirror_transport::TransportError;
use mirror_tree::TreeError;
use thiserror::Error;

/// Failure of a materialization request.
///
/// Cloneable because one result fans out to every waiter sharing an
/// in-flight leaf; source errors are held behind `Arc` for that reason.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("chunk {leaf} failed verification after {attempts} attempts")]
    VerificationExhausted { leaf: u64, attempts: u32 },

    #[error("transport: {0}")]
    Transport(Arc<TransportError>),

    #[error("tree: {0}")]
    Tree(Arc<TreeError>),

    #[error("store: {0}")]
    Store(Arc<StoreError>),

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        Self::Transport(Arc::new(err))
    }
}

impl From<TreeError> for FetchError {
    fn from(err: TreeError) -> Self {
        Self::Tree(Arc::new(err))
    }
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        Self::Store(Arc::new(err))
    }
}

/// Failure surfaced by the verified file channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("operation not supported on a verified read-only channel")]
    Unsupported,
}

/// Failure while wiring up a mirror (resolving the artifact, fetching
/// the reference sidecar, opening the local files).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MirrorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("artifact is {remote} bytes but the reference tree covers {tree}")]
    SizeMismatch { remote: u64, tree: u64 },
}
