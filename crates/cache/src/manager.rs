//! The transfer scheduler: turns byte-range demands into bounded
//! ranged requests, verifies every fetched chunk against the state
//! tree's reference hashes, and commits accepted chunks to the local
//! store.
//!
//! One scheduler owns all transfer state; clones are cheap handles onto
//! it, in the manager/client split the rest of the workspace uses.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mirror_primitives::{Event, EventSink, Shape};
use mirror_store::ChunkStore;
use mirror_transport::{RangeFetcher, TransportError};
use mirror_tree::{StateTree, TreeError};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::TransferConfig;
use crate::error::FetchError;
use crate::plan::{self, Transfer};

/// Completion slot for one leaf: `None` while in flight.
type LeafSlot = Option<Result<(), FetchError>>;

/// Rounds a request will re-enter scheduling after losing leaves to a
/// competing cancellation (a dropped read-ahead, typically).
const MAX_SCHEDULE_ROUNDS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Priority {
    Foreground,
    Background,
}

/// Schedules, downloads, verifies and commits missing chunks.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferManager")
            .field("url", &self.inner.url.as_str())
            .field("shape", &self.inner.shape)
            .field("inflight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

struct ReadWindow {
    last_end: u64,
    consecutive: u32,
    auto: bool,
}

struct Inner {
    url: Url,
    shape: Shape,
    state: Arc<StateTree>,
    store: Arc<ChunkStore>,
    fetcher: Arc<dyn RangeFetcher>,
    sink: Arc<dyn EventSink>,
    config: TransferConfig,
    inflight: DashMap<u64, watch::Receiver<LeafSlot>>,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    window: Mutex<ReadWindow>,
    readahead: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TransferManager {
    pub fn new(
        url: Url,
        state: Arc<StateTree>,
        store: Arc<ChunkStore>,
        fetcher: Arc<dyn RangeFetcher>,
        sink: Arc<dyn EventSink>,
        config: TransferConfig,
    ) -> Self {
        let shape = state.shape();
        let permits = Arc::new(Semaphore::new(config.max_inflight));

        Self {
            inner: Arc::new(Inner {
                url,
                shape,
                state,
                store,
                fetcher,
                sink,
                config,
                inflight: DashMap::new(),
                permits,
                active: AtomicUsize::new(0),
                window: Mutex::new(ReadWindow {
                    last_end: 0,
                    consecutive: 0,
                    auto: false,
                }),
                readahead: Mutex::new(CancellationToken::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn shape(&self) -> Shape {
        self.inner.shape
    }

    pub fn state(&self) -> Arc<StateTree> {
        Arc::clone(&self.inner.state)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Resolves once every leaf overlapping `[lo, hi)` is verified and
    /// committed, downloading whatever is missing. Honors the
    /// configured per-read timeout.
    pub async fn ensure_range(&self, lo: u64, hi: u64) -> Result<(), FetchError> {
        let materialize = Arc::clone(&self.inner).ensure_range(lo, hi, Priority::Foreground);
        match self.inner.config.read_timeout {
            Some(limit) => tokio::time::timeout(limit, materialize)
                .await
                .map_err(|_elapsed| FetchError::Timeout)?,
            None => materialize.await,
        }
    }

    /// Feeds the sequential-access detector. Called by the channel on
    /// every read, before the materialization step.
    pub(crate) fn observe_read(&self, lo: u64, hi: u64) {
        self.inner.observe_read(lo, hi);
    }

    /// Orderly shutdown: cancel queued work, give in-flight transfers
    /// the configured grace, rehash covered internal nodes, flush the
    /// state tree. Never fails; callers waiting on reads see
    /// `Cancelled`.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }

        inner.sink.emit(Event::ShutdownInit);
        inner.shutdown.cancel();
        inner.readahead.lock().cancel();

        inner.sink.emit(Event::ShutdownStopping);
        inner.tracker.close();
        if tokio::time::timeout(inner.config.shutdown_grace, inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("Shutdown grace elapsed with transfers still in flight");
        }

        inner.sink.emit(Event::ShutdownHashing);
        let state = Arc::clone(&inner.state);
        if tokio::task::spawn_blocking(move || state.recompute_covered_internals())
            .await
            .is_err()
        {
            error!("Internal rehash task panicked");
        }

        inner.sink.emit(Event::ShutdownFlushing);
        let state = Arc::clone(&inner.state);
        match tokio::task::spawn_blocking(move || state.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(TreeError::Detached)) => debug!("State tree is detached, nothing to flush"),
            Ok(Err(err)) => error!(error = %err, "Failed to flush state tree"),
            Err(_) => error!("State flush task panicked"),
        }

        inner.sink.emit(Event::ShutdownComplete);
    }
}

impl Inner {
    async fn ensure_range(
        self: Arc<Self>,
        lo: u64,
        hi: u64,
        priority: Priority,
    ) -> Result<(), FetchError> {
        let mut rounds = 0_u32;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let missing = plan::missing_in_range(&self.shape, lo, hi, |k| self.state.is_valid(k));
            if missing.is_empty() {
                return Ok(());
            }

            rounds += 1;
            if rounds > MAX_SCHEDULE_ROUNDS {
                return Err(FetchError::Cancelled);
            }

            // Subscribe to leaves another request is already fetching;
            // claim the rest.
            let mut waiters = Vec::with_capacity(missing.len());
            let mut senders: HashMap<u64, watch::Sender<LeafSlot>> = HashMap::new();
            let mut to_schedule = Vec::new();
            for &k in &missing {
                match self.inflight.entry(k) {
                    Entry::Occupied(entry) => waiters.push(entry.get().clone()),
                    Entry::Vacant(slot) => {
                        let (tx, rx) = watch::channel(None);
                        let _ = slot.insert(rx.clone());
                        waiters.push(rx);
                        let _ = senders.insert(k, tx);
                        to_schedule.push(k);
                    }
                }
            }

            if !to_schedule.is_empty() {
                let target = plan::target_xfer_bytes(
                    self.active.load(Ordering::Relaxed),
                    self.config.min_xfer,
                    self.config.max_xfer,
                );
                for transfer in
                    plan::coalesce(&self.shape, &to_schedule, self.config.min_xfer, target)
                {
                    let mut owned = HashMap::new();
                    for k in transfer.leaves() {
                        if let Some(tx) = senders.remove(&k) {
                            let _ = owned.insert(k, tx);
                        }
                    }
                    self.spawn_transfer(transfer, owned, priority);
                }
            }

            let mut failure: Option<FetchError> = None;
            let mut lost_leaves = false;
            for mut rx in waiters {
                match rx.wait_for(|slot| slot.is_some()).await {
                    Ok(slot) => match slot.clone().expect("waited for a set slot") {
                        Ok(()) => {}
                        Err(FetchError::Cancelled) => lost_leaves = true,
                        Err(err) => {
                            if failure.is_none() {
                                failure = Some(err);
                            }
                        }
                    },
                    Err(_closed) => lost_leaves = true,
                }
            }

            if let Some(err) = failure {
                return Err(err);
            }
            if !lost_leaves {
                return Ok(());
            }
            // Some leaves were abandoned under us (a dropped read-ahead
            // or a saturated background transfer); reschedule them as
            // our own.
        }
    }

    fn spawn_transfer(
        self: &Arc<Self>,
        transfer: Transfer,
        senders: HashMap<u64, watch::Sender<LeafSlot>>,
        priority: Priority,
    ) {
        let cancel = match priority {
            Priority::Foreground => self.shutdown.clone(),
            Priority::Background => self.readahead.lock().clone(),
        };

        let inner = Arc::clone(self);
        let _handle = self.tracker.spawn(async move {
            inner.run_transfer(transfer, senders, cancel, priority).await;
        });
    }

    async fn run_transfer(
        &self,
        transfer: Transfer,
        mut senders: HashMap<u64, watch::Sender<LeafSlot>>,
        cancel: CancellationToken,
        priority: Priority,
    ) {
        let _permit = match priority {
            // Background transfers never contend with foreground ones:
            // no free slot, no transfer.
            Priority::Background => match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return self.abandon(transfer, senders),
            },
            Priority::Foreground => tokio::select! {
                () = cancel.cancelled() => return self.abandon(transfer, senders),
                permit = Arc::clone(&self.permits).acquire_owned() => {
                    permit.expect("transfer semaphore is never closed")
                }
            },
        };

        let _ = self.active.fetch_add(1, Ordering::Relaxed);
        let result = self.execute(transfer, &mut senders).await;
        let _ = self.active.fetch_sub(1, Ordering::Relaxed);

        if let Err(err) = result {
            for (k, tx) in senders.drain() {
                let _ = tx.send(Some(Err(err.clone())));
                let _ = self.inflight.remove(&k);
            }
        }
    }

    /// Fetch the transfer's byte range, then verify and commit chunk by
    /// chunk. Per-chunk verification failures are settled inside
    /// [`Inner::commit_chunk`] and only affect that leaf's waiters.
    async fn execute(
        &self,
        transfer: Transfer,
        senders: &mut HashMap<u64, watch::Sender<LeafSlot>>,
    ) -> Result<(), FetchError> {
        self.sink.emit(Event::RangeStart {
            from_leaf: transfer.from_leaf,
            to_leaf: transfer.to_leaf,
            byte_begin: transfer.byte_begin,
            byte_end: transfer.byte_end,
            size: transfer.size(),
        });
        let started = Instant::now();

        let bytes = self
            .fetch_with_retries(transfer.byte_begin, transfer.byte_end)
            .await?;

        for k in transfer.leaves() {
            // Gap leaves bridged for coalescing may already be valid;
            // nobody is waiting on them, so skip the re-verify.
            if self.state.is_valid(k) && !senders.contains_key(&k) {
                continue;
            }

            let (start, end) = self.shape.chunk_range(k);
            let chunk = bytes
                .slice((start - transfer.byte_begin) as usize..(end - transfer.byte_begin) as usize);

            let result = self.commit_chunk(k, chunk).await;
            if let Some(tx) = senders.remove(&k) {
                let _ = tx.send(Some(result));
                let _ = self.inflight.remove(&k);
            }
        }

        self.sink.emit(Event::RangeDone {
            from_leaf: transfer.from_leaf,
            to_leaf: transfer.to_leaf,
            byte_begin: transfer.byte_begin,
            byte_end: transfer.byte_end,
            size: transfer.size(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    /// Verify-then-commit for one chunk, with the per-chunk retry
    /// ladder: a mismatch re-fetches just this chunk with backoff until
    /// it verifies or the retry budget runs out.
    async fn commit_chunk(&self, k: u64, bytes: Bytes) -> Result<(), FetchError> {
        let mut payload = bytes;
        let mut attempt = 0_u32;
        loop {
            self.sink.emit(Event::ChunkVerifyStart { leaf_index: k });

            let state = Arc::clone(&self.state);
            let store = Arc::clone(&self.store);
            let data = payload.clone();
            let accepted = tokio::task::spawn_blocking(move || {
                state.try_accept_chunk(k, &data, |verified| {
                    store.write_chunk(k, verified).map_err(std::io::Error::other)
                })
            })
            .await
            .expect("chunk verification task panicked")
            .map_err(FetchError::from)?;

            if accepted {
                self.sink.emit(Event::ChunkVerifyOk { leaf_index: k });
                return Ok(());
            }

            // The state tree already emitted the failure event with
            // both hashes.
            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(FetchError::VerificationExhausted {
                    leaf: k,
                    attempts: attempt,
                });
            }
            self.sink.emit(Event::ChunkVerifyRetry {
                leaf_index: k,
                attempt,
            });
            sleep(self.backoff(attempt)).await;

            let (start, end) = self.shape.chunk_range(k);
            payload = self.fetch_with_retries(start, end).await?;
        }
    }

    async fn fetch_with_retries(&self, lo: u64, hi: u64) -> Result<Bytes, FetchError> {
        let mut attempt = 0_u32;
        loop {
            let outcome = match self.fetcher.get_range(&self.url, lo, hi).await {
                Ok(bytes) => {
                    if bytes.len() as u64 == hi - lo {
                        return Ok(bytes);
                    }
                    FetchError::from(TransportError::ShortBody {
                        lo,
                        hi,
                        got: bytes.len() as u64,
                    })
                }
                Err(err) => FetchError::from(err),
            };

            attempt += 1;
            if attempt > self.config.max_net_retries {
                return Err(outcome);
            }
            warn!(%lo, %hi, %attempt, error = %outcome, "Ranged fetch failed, retrying");
            sleep(self.backoff(attempt)).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff * 2_u32.pow(attempt.saturating_sub(1).min(10))
    }

    fn abandon(&self, transfer: Transfer, senders: HashMap<u64, watch::Sender<LeafSlot>>) {
        for (k, tx) in senders {
            let _ = tx.send(Some(Err(FetchError::Cancelled)));
            let _ = self.inflight.remove(&k);
        }
        debug!(
            from = transfer.from_leaf,
            to = transfer.to_leaf,
            "Transfer abandoned"
        );
    }

    fn observe_read(self: &Arc<Self>, lo: u64, hi: u64) {
        let hi = hi.min(self.shape.total_content_size());
        if lo >= hi {
            return;
        }

        let armed = {
            let mut window = self.window.lock();
            if window.consecutive > 0 && lo == window.last_end {
                window.consecutive += 1;
            } else {
                if window.auto {
                    window.auto = false;
                    let mut token = self.readahead.lock();
                    token.cancel();
                    *token = CancellationToken::new();
                    debug!("Sequential pattern broken, read-ahead dropped");
                }
                window.consecutive = 1;
            }
            window.last_end = hi;

            if !window.auto && window.consecutive >= self.config.autobuffer_threshold {
                window.auto = true;
                self.sink.emit(Event::AutoBufferOn {
                    consecutive_count: window.consecutive,
                    threshold: self.config.autobuffer_threshold,
                });
            }
            window.auto
        };

        if armed {
            self.schedule_readahead(hi);
        }
    }

    /// Schedules a background transfer for the leaves just past the
    /// most recently requested one, sized like a regular transfer.
    fn schedule_readahead(self: &Arc<Self>, hi: u64) {
        let last_leaf = self.shape.leaf_of_offset(hi - 1);
        let from = last_leaf + 1;
        if from >= self.shape.leaf_count() {
            return;
        }

        let target = plan::target_xfer_bytes(
            self.active.load(Ordering::Relaxed),
            self.config.min_xfer,
            self.config.max_xfer,
        );
        let window_leaves = (target / self.shape.chunk_size()).max(1);
        let to = (from + window_leaves - 1).min(self.shape.leaf_count() - 1);

        let (lo_byte, _) = self.shape.chunk_range(from);
        let (_, hi_byte) = self.shape.chunk_range(to);
        let untouched = plan::missing_in_range(&self.shape, lo_byte, hi_byte, |k| {
            self.state.is_valid(k) || self.inflight.contains_key(&k)
        });
        if untouched.is_empty() {
            return;
        }

        self.sink.emit(Event::ReadAhead {
            from_leaf: from,
            to_leaf: to,
        });

        let inner = Arc::clone(self);
        let token = self.readahead.lock().clone();
        let _handle = self.tracker.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                result = Arc::clone(&inner).ensure_range(lo_byte, hi_byte, Priority::Background) => {
                    if let Err(err) = result {
                        debug!(error = %err, "Read-ahead abandoned");
                    }
                }
            }
        });
    }
}
