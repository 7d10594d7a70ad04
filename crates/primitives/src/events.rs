use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Observability events emitted by the transfer scheduler and tree
/// store.
///
/// The schema is stable: sinks may serialize events and ship them out
/// of process, so variants carry owned, plain fields only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[non_exhaustive]
pub enum Event {
    #[serde(rename = "RANGE_START")]
    RangeStart {
        from_leaf: u64,
        to_leaf: u64,
        byte_begin: u64,
        byte_end: u64,
        size: u64,
    },

    #[serde(rename = "RANGE_DONE")]
    RangeDone {
        from_leaf: u64,
        to_leaf: u64,
        byte_begin: u64,
        byte_end: u64,
        size: u64,
        elapsed_ms: u64,
    },

    #[serde(rename = "CHUNK_VFY_START")]
    ChunkVerifyStart { leaf_index: u64 },

    #[serde(rename = "CHUNK_VFY_OK")]
    ChunkVerifyOk { leaf_index: u64 },

    #[serde(rename = "CHUNK_VFY_FAIL")]
    ChunkVerifyFail {
        leaf_index: u64,
        reference_hash_hex: String,
        computed_hash_hex: String,
    },

    #[serde(rename = "CHUNK_VFY_RETRY")]
    ChunkVerifyRetry { leaf_index: u64, attempt: u32 },

    #[serde(rename = "AUTO_BUFFER_ON")]
    AutoBufferOn {
        consecutive_count: u32,
        threshold: u32,
    },

    #[serde(rename = "READ_AHEAD")]
    ReadAhead { from_leaf: u64, to_leaf: u64 },

    #[serde(rename = "SHUTDOWN_INIT")]
    ShutdownInit,

    #[serde(rename = "SHUTDOWN_STOPPING")]
    ShutdownStopping,

    #[serde(rename = "SHUTDOWN_HASHING")]
    ShutdownHashing,

    #[serde(rename = "SHUTDOWN_FLUSHING")]
    ShutdownFlushing,

    #[serde(rename = "SHUTDOWN_COMPLETE")]
    ShutdownComplete,
}

/// Sink for [`Event`]s, injected into the core so it stays decoupled
/// from any particular logging or metrics framework.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events to the ambient `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::RangeStart {
                from_leaf,
                to_leaf,
                byte_begin,
                byte_end,
                size,
            } => debug!(%from_leaf, %to_leaf, %byte_begin, %byte_end, %size, "Transfer started"),
            Event::RangeDone {
                from_leaf,
                to_leaf,
                size,
                elapsed_ms,
                ..
            } => debug!(%from_leaf, %to_leaf, %size, %elapsed_ms, "Transfer done"),
            Event::ChunkVerifyStart { leaf_index } => debug!(%leaf_index, "Verifying chunk"),
            Event::ChunkVerifyOk { leaf_index } => debug!(%leaf_index, "Chunk verified"),
            Event::ChunkVerifyFail {
                leaf_index,
                reference_hash_hex,
                computed_hash_hex,
            } => warn!(
                %leaf_index,
                %reference_hash_hex,
                %computed_hash_hex,
                "Chunk verification failed",
            ),
            Event::ChunkVerifyRetry {
                leaf_index,
                attempt,
            } => warn!(%leaf_index, %attempt, "Retrying chunk"),
            Event::AutoBufferOn {
                consecutive_count,
                threshold,
            } => info!(%consecutive_count, %threshold, "Sequential access detected"),
            Event::ReadAhead { from_leaf, to_leaf } => {
                debug!(%from_leaf, %to_leaf, "Read-ahead scheduled");
            }
            Event::ShutdownInit => info!("Shutdown initiated"),
            Event::ShutdownStopping => info!("Shutdown stopping transfers"),
            Event::ShutdownHashing => info!("Shutdown rehashing internal nodes"),
            Event::ShutdownFlushing => info!("Shutdown flushing state"),
            Event::ShutdownComplete => info!("Shutdown complete"),
        }
    }
}
