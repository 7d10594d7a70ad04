//! Shared test collaborators: an in-memory range fetcher with fault
//! injection and an event-recording sink.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camino::Utf8PathBuf;
use futures_util::stream;
use futures_util::StreamExt as _;
use mirror_cache::manager::TransferManager;
use mirror_cache::TransferConfig;
use mirror_primitives::{Event, EventSink, Shape};
use mirror_store::ChunkStore;
use mirror_transport::{ByteStream, RangeFetcher, TransportError};
use mirror_tree::{ReferenceTree, StateTree};
use rand::rngs::StdRng;
use rand::{RngCore as _, SeedableRng as _};
use tempdir::TempDir;
use url::Url;

pub const MIB: u64 = 1 << 20;

/// Serves ranges out of memory, with switches to corrupt specific
/// leaves or fail whole requests a configured number of times.
pub struct MemoryFetcher {
    blobs: HashMap<String, Vec<u8>>,
    artifact: String,
    chunk_size: u64,
    corrupt: Mutex<HashMap<u64, u32>>,
    fail_next: Mutex<u32>,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<(u64, u64)>>,
    sidecar_gets: Mutex<u32>,
}

impl MemoryFetcher {
    pub fn new(artifact_url: &Url, data: Vec<u8>, chunk_size: u64) -> Self {
        let mut blobs = HashMap::new();
        let _ = blobs.insert(artifact_url.to_string(), data);
        Self {
            blobs,
            artifact: artifact_url.to_string(),
            chunk_size,
            corrupt: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(0),
            delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            sidecar_gets: Mutex::new(0),
        }
    }

    pub fn with_blob(mut self, url: &Url, data: Vec<u8>) -> Self {
        let _ = self.blobs.insert(url.to_string(), data);
        self
    }

    /// The next `servings` of leaf `k` come back with a flipped byte.
    pub fn corrupt_leaf(&self, k: u64, servings: u32) {
        let _ = self.corrupt.lock().unwrap().insert(k, servings);
    }

    /// The next `times` artifact requests fail with a 503.
    pub fn fail_next(&self, times: u32) {
        *self.fail_next.lock().unwrap() = times;
    }

    /// Every subsequent ranged request stalls this long first.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Every ranged artifact request observed so far, in arrival order.
    pub fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn sidecar_gets(&self) -> u32 {
        *self.sidecar_gets.lock().unwrap()
    }

    fn serve(&self, url: &Url, lo: u64, hi: u64) -> Result<Bytes, TransportError> {
        let Some(data) = self.blobs.get(url.as_str()) else {
            return Err(TransportError::Status {
                status: 404,
                url: url.to_string(),
            });
        };

        let is_artifact = url.as_str() == self.artifact;
        if is_artifact {
            self.requests.lock().unwrap().push((lo, hi));

            let mut failures = self.fail_next.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Status {
                    status: 503,
                    url: url.to_string(),
                });
            }
        } else {
            *self.sidecar_gets.lock().unwrap() += 1;
        }

        if hi > data.len() as u64 || lo >= hi {
            return Err(TransportError::Status {
                status: 416,
                url: url.to_string(),
            });
        }

        let mut body = data[lo as usize..hi as usize].to_vec();
        if is_artifact {
            let mut corrupt = self.corrupt.lock().unwrap();
            for (&leaf, servings) in corrupt.iter_mut() {
                let leaf_start = leaf * self.chunk_size;
                if *servings > 0 && leaf_start >= lo && leaf_start < hi {
                    body[(leaf_start - lo) as usize] ^= 0xA5;
                    *servings -= 1;
                }
            }
        }
        Ok(Bytes::from(body))
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn head(&self, url: &Url) -> Result<u64, TransportError> {
        self.blobs
            .get(url.as_str())
            .map(|data| data.len() as u64)
            .ok_or_else(|| TransportError::Status {
                status: 404,
                url: url.to_string(),
            })
    }

    async fn get_range(&self, url: &Url, lo: u64, hi: u64) -> Result<Bytes, TransportError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.serve(url, lo, hi)
    }

    async fn get_range_stream(
        &self,
        url: &Url,
        lo: u64,
        hi: u64,
    ) -> Result<ByteStream, TransportError> {
        let bytes = self.serve(url, lo, hi)?;
        Ok(stream::iter(vec![Ok(bytes)]).boxed())
    }
}

#[derive(Default)]
pub struct RecordingSink(Mutex<Vec<Event>>);

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

static TRACING: Once = Once::new();

/// Routes test logs through `RUST_LOG` when a test needs watching.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn random_source(len: u64, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0_u8; len as usize];
    rng.fill_bytes(&mut data);
    data
}

/// A fully wired mirror over an in-memory artifact.
pub struct Fixture {
    _dir: TempDir,
    pub root: Utf8PathBuf,
    pub source: Vec<u8>,
    pub url: Url,
    pub fetcher: Arc<MemoryFetcher>,
    pub sink: Arc<RecordingSink>,
    pub state: Arc<StateTree>,
    pub store: Arc<ChunkStore>,
}

impl Fixture {
    pub fn new(name: &str, total: u64) -> Self {
        init_tracing();
        let dir = TempDir::new(name).unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = random_source(total, 7);
        let url = Url::parse("https://cdn.example.com/artifact.bin").unwrap();

        let shape = Shape::from_content_size(total).unwrap();
        let reference = ReferenceTree::build(shape, &source).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let state = StateTree::create(&reference, &root.join("artifact.bin.mrkl"))
            .unwrap()
            .with_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        let store = ChunkStore::create(&root.join("artifact.bin"), shape).unwrap();
        let fetcher = Arc::new(MemoryFetcher::new(&url, source.clone(), shape.chunk_size()));

        Self {
            _dir: dir,
            root,
            source,
            url,
            fetcher,
            sink,
            state: Arc::new(state),
            store: Arc::new(store),
        }
    }

    pub fn manager(&self, config: TransferConfig) -> TransferManager {
        TransferManager::new(
            self.url.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher) as Arc<dyn RangeFetcher>,
            Arc::clone(&self.sink) as Arc<dyn EventSink>,
            config,
        )
    }
}
