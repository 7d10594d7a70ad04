//! On-demand, verified materialization of remote artifacts.
//!
//! A mirror holds a sparse local copy of an immutable remote file and a
//! Merkle state tree over it. Reads trigger downloads of exactly the
//! missing chunks, each verified against the trusted reference tree
//! before it is committed; interrupted sessions resume from the
//! persisted bitmap without re-fetching anything already verified.

use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use mirror_primitives::EventSink;
use mirror_store::ChunkStore;
use mirror_transport::{reference_url, RangeFetcher};
use mirror_tree::{ReferenceTree, StateTree, TreeError, REFERENCE_EXT, STATE_EXT};
use tracing::{info, warn};
use url::Url;

pub mod channel;
pub mod config;
mod error;
pub mod manager;
pub mod plan;

pub use channel::MirrorChannel;
pub use config::TransferConfig;
pub use error::{ChannelError, FetchError, MirrorError};
pub use manager::TransferManager;

/// Opens a verified channel onto a remote artifact, mirrored under
/// `dir`.
///
/// Resolves the artifact size, fetches (or reuses) the `.mref`
/// reference sidecar, creates or resumes the `.mrkl` state tree and the
/// sparse data file, and wires the scheduler over them.
pub async fn open(
    artifact_url: Url,
    dir: &Utf8Path,
    config: TransferConfig,
    fetcher: Arc<dyn RangeFetcher>,
    sink: Arc<dyn EventSink>,
) -> Result<MirrorChannel, MirrorError> {
    let remote_size = fetcher.head(&artifact_url).await?;
    let name = artifact_name(&artifact_url);

    let reference_path = dir.join(format!("{name}.{REFERENCE_EXT}"));
    let reference = match ReferenceTree::load(&reference_path) {
        Ok(tree) => tree,
        Err(TreeError::Io(ref err)) if err.kind() == std::io::ErrorKind::NotFound => {
            fetch_reference(&artifact_url, fetcher.as_ref(), &reference_path).await?
        }
        Err(TreeError::Corrupt(reason)) => {
            warn!(%reference_path, %reason, "Reference sidecar unreadable, refetching");
            fs::rename(&reference_path, format!("{reference_path}.corrupted"))
                .map_err(TreeError::Io)?;
            fetch_reference(&artifact_url, fetcher.as_ref(), &reference_path).await?
        }
        Err(err) => return Err(err.into()),
    };

    if reference.shape().total_content_size() != remote_size {
        return Err(MirrorError::SizeMismatch {
            remote: remote_size,
            tree: reference.shape().total_content_size(),
        });
    }

    let store_path = dir.join(&name);
    let store_existed = store_path.exists();
    let store = Arc::new(ChunkStore::open_or_create(&store_path, reference.shape())?);

    let state_path = dir.join(format!("{name}.{STATE_EXT}"));
    let state = resume_state(&reference, &state_path, store_existed)?;
    let state = Arc::new(state.with_sink(Arc::clone(&sink)));

    info!(
        url = %artifact_url,
        size = %remote_size,
        resumed = %state.valid_count(),
        "Mirror opened"
    );

    let manager = TransferManager::new(
        artifact_url,
        state,
        Arc::clone(&store),
        fetcher,
        sink,
        config,
    );
    Ok(MirrorChannel::new(manager, store))
}

async fn fetch_reference(
    artifact_url: &Url,
    fetcher: &dyn RangeFetcher,
    reference_path: &Utf8Path,
) -> Result<ReferenceTree, MirrorError> {
    let sidecar_url = reference_url(artifact_url);
    let sidecar_size = fetcher.head(&sidecar_url).await?;
    let bytes = fetcher.get_range(&sidecar_url, 0, sidecar_size).await?;

    let tree = ReferenceTree::from_image_bytes(&bytes)?;
    tree.save(reference_path)?;
    info!(url = %sidecar_url, leaves = %tree.shape().leaf_count(), "Reference tree fetched");
    Ok(tree)
}

/// Reuses an existing state tree when it matches the reference;
/// anything stale, corrupt, or orphaned (its data file vanished) is
/// replaced by a fresh all-clear derivation.
fn resume_state(
    reference: &ReferenceTree,
    state_path: &Utf8Path,
    store_existed: bool,
) -> Result<StateTree, TreeError> {
    if !store_existed {
        return StateTree::create(reference, state_path);
    }

    match StateTree::load(state_path) {
        Ok(state) if state.shape() == reference.shape() => Ok(state),
        Ok(state) => {
            warn!(
                %state_path,
                ?state,
                "State tree does not match the reference, starting over"
            );
            StateTree::create(reference, state_path)
        }
        Err(TreeError::Io(ref err)) if err.kind() == std::io::ErrorKind::NotFound => {
            StateTree::create(reference, state_path)
        }
        Err(TreeError::Corrupt(reason)) => {
            warn!(%state_path, %reason, "State tree unreadable, starting over");
            StateTree::create(reference, state_path)
        }
        Err(err) => Err(err),
    }
}

fn artifact_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("artifact")
        .to_owned()
}
