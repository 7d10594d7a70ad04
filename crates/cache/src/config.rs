use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1 << 20;

/// Tuning knobs for the transfer scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfers below this size are avoided where the geometry allows.
    pub min_xfer: u64,

    /// Hard ceiling on a single ranged request.
    pub max_xfer: u64,

    /// Concurrent transfer budget.
    pub max_inflight: usize,

    /// Per-chunk verification retries before giving up on a leaf.
    pub max_retries: u32,

    /// Transport retries per ranged request.
    pub max_net_retries: u32,

    /// Base delay of the exponential retry backoff.
    pub retry_backoff: Duration,

    /// How long in-flight transfers get to finish on close.
    pub shutdown_grace: Duration,

    /// Consecutive contiguous reads that arm read-ahead.
    pub autobuffer_threshold: u32,

    /// Ceiling on how long one read may wait for materialization.
    /// `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_xfer: MIB,
            max_xfer: 5 * MIB,
            max_inflight: 16,
            max_retries: 3,
            max_net_retries: 3,
            retry_backoff: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
            autobuffer_threshold: 10,
            read_timeout: None,
        }
    }
}
