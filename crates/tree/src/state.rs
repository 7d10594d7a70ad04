//! The client's working tree: node hashes copied from the reference
//! (which stays authoritative for every slot), plus a validity bitmap
//! that fills in as chunks are downloaded and verified.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt as _;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use mirror_primitives::{Digest, Event, EventSink, NullSink, Shape, DIGEST_SIZE};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::bitmap::Bitmap;
use crate::engine::{leaf_digest, node_digest};
use crate::error::TreeError;
use crate::image::{read_image, write_image, TreeImage};
use crate::proof::{path_proof_from_nodes, ProofStep};
use crate::reference::ReferenceTree;

const STRIPE_COUNT: usize = 64;

struct Backing {
    file: fs::File,
    path: Utf8PathBuf,
}

pub struct StateTree {
    shape: Shape,
    nodes: RwLock<Vec<Digest>>,
    bitmap: Bitmap,
    stripes: Vec<Mutex<()>>,
    backing: Mutex<Option<Backing>>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("shape", &self.shape)
            .field("valid", &self.bitmap.count_ones())
            .finish_non_exhaustive()
    }
}

impl StateTree {
    /// Derives a state tree from a reference and persists it at
    /// `state_path` with an all-clear bitmap.
    pub fn create(reference: &ReferenceTree, state_path: &Utf8Path) -> Result<Self, TreeError> {
        let tree = Self::detached(reference);
        write_image(
            state_path,
            &tree.shape,
            &tree.nodes.read(),
            &tree.bitmap.to_bytes(),
        )?;
        tree.attach(state_path)?;
        Ok(tree)
    }

    /// Same derivation without a backing file. Bitmap updates stay in
    /// memory until [`StateTree::save_to`] is called.
    pub fn detached(reference: &ReferenceTree) -> Self {
        Self {
            shape: reference.shape(),
            nodes: RwLock::new(reference.nodes().to_vec()),
            bitmap: Bitmap::new(reference.shape().leaf_count()),
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
            backing: Mutex::new(None),
            sink: Arc::new(NullSink),
        }
    }

    pub fn load(path: &Utf8Path) -> Result<Self, TreeError> {
        let image = read_image(path)?;
        let tree = Self::from_image(image);
        tree.attach(path)?;
        Ok(tree)
    }

    pub(crate) fn from_image(image: TreeImage) -> Self {
        Self {
            shape: image.shape,
            nodes: RwLock::new(image.nodes),
            bitmap: image.bitmap,
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
            backing: Mutex::new(None),
            sink: Arc::new(NullSink),
        }
    }

    /// Routes verification-failure events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub(crate) fn attach(&self, path: &Utf8Path) -> Result<(), TreeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_std_path())?;
        *self.backing.lock() = Some(Backing {
            file,
            path: path.to_owned(),
        });
        Ok(())
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn is_valid(&self, k: u64) -> bool {
        k < self.shape.leaf_count() && self.bitmap.get(k)
    }

    pub fn valid_count(&self) -> u64 {
        self.bitmap.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_full()
    }

    pub fn set_valid(&self, k: u64) -> Result<(), TreeError> {
        self.check_leaf(k)?;
        let _guard = self.stripes[k as usize % STRIPE_COUNT].lock();
        let _ = self.bitmap.set(k);
        self.persist_word(k)
    }

    pub fn clear_valid(&self, k: u64) -> Result<(), TreeError> {
        self.check_leaf(k)?;
        let _guard = self.stripes[k as usize % STRIPE_COUNT].lock();
        let _ = self.bitmap.clear(k);
        self.persist_word(k)
    }

    pub fn hash_of_leaf(&self, k: u64) -> Result<Digest, TreeError> {
        self.check_leaf(k)?;
        Ok(self.nodes.read()[self.shape.node_index(k) as usize])
    }

    /// Internal hashes may only be consulted once every descendant leaf
    /// is valid; elsewhere they are unspecified.
    pub fn hash_of_node(&self, i: u64) -> Result<Digest, TreeError> {
        if i >= self.shape.node_count() {
            return Err(TreeError::OutOfRange {
                index: i,
                node_count: self.shape.node_count(),
            });
        }
        if !self.subtree_valid(i) {
            return Err(TreeError::Unavailable { node: i });
        }
        Ok(self.nodes.read()[i as usize])
    }

    /// Verifies `bytes` against the reference hash for leaf `k`. On a
    /// match, `on_accept` persists the bytes (the chunk-store write),
    /// then the valid bit is set and its bitmap word flushed; all of it
    /// under the leaf's stripe so a reader that observes the bit also
    /// observes the bytes. On a mismatch nothing is touched and a
    /// verification-failure event is emitted.
    pub fn try_accept_chunk<F>(&self, k: u64, bytes: &[u8], on_accept: F) -> Result<bool, TreeError>
    where
        F: FnOnce(&[u8]) -> io::Result<()>,
    {
        let expected = self.hash_of_leaf(k)?;
        let computed = leaf_digest(bytes);

        if computed != expected {
            debug!(leaf = %k, %expected, %computed, "Chunk rejected");
            self.sink.emit(Event::ChunkVerifyFail {
                leaf_index: k,
                reference_hash_hex: expected.to_hex(),
                computed_hash_hex: computed.to_hex(),
            });
            return Ok(false);
        }

        let _guard = self.stripes[k as usize % STRIPE_COUNT].lock();
        on_accept(bytes)?;
        let _ = self.bitmap.set(k);
        self.persist_word(k)?;
        Ok(true)
    }

    /// Recomputes every internal hash whose descendant leaves are all
    /// valid, so the persisted state carries exact ancestors wherever
    /// the data supports them. One bottom-up pass: a node is covered
    /// exactly when both children are.
    pub fn recompute_covered_internals(&self) {
        let node_count = self.shape.node_count() as usize;
        let first_leaf = self.shape.first_leaf_index() as usize;

        let mut covered = vec![false; node_count];
        for idx in first_leaf..node_count {
            covered[idx] = self.bitmap.get((idx - first_leaf) as u64);
        }

        let mut nodes = self.nodes.write();
        for i in (0..first_leaf).rev() {
            let (left, right) = self.shape.children(i as u64).expect("internal node");
            let (left, right) = (left as usize, right as usize);
            if covered[left] && covered[right] {
                covered[i] = true;
                nodes[i] = node_digest(&nodes[left], &nodes[right]);
            }
        }
    }

    /// Proof for a leaf inside a fully-valid subtree rooted at the top.
    /// Fails with `Unavailable` if any node on the path would be
    /// unspecified.
    pub fn path_proof(&self, k: u64) -> Result<Vec<ProofStep>, TreeError> {
        self.check_leaf(k)?;
        // Every sibling on the path must be consultable.
        let mut node = self.shape.node_index(k);
        while let Some(parent) = self.shape.parent(node) {
            let sibling = self.shape.sibling(node).expect("non-root node");
            let _ = self.hash_of_node(sibling)?;
            node = parent;
        }
        path_proof_from_nodes(&self.shape, &self.nodes.read(), k)
    }

    /// Persists the full tree (hashes, bitmap, footer) atomically to
    /// the backing path.
    pub fn save(&self) -> Result<(), TreeError> {
        let path = {
            let backing = self.backing.lock();
            let Some(backing) = backing.as_ref() else {
                return Err(TreeError::Detached);
            };
            backing.path.clone()
        };
        self.save_to(&path)?;
        // The rename replaced the inode our handle pointed at.
        self.attach(&path)
    }

    pub fn save_to(&self, path: &Utf8Path) -> Result<(), TreeError> {
        write_image(path, &self.shape, &self.nodes.read(), &self.bitmap.to_bytes())
    }

    fn check_leaf(&self, k: u64) -> Result<(), TreeError> {
        if k >= self.shape.leaf_count() {
            return Err(TreeError::LeafOutOfRange {
                leaf: k,
                leaf_count: self.shape.leaf_count(),
            });
        }
        Ok(())
    }

    /// Whether every leaf under node `i` is valid. Leaf numbers under a
    /// subtree need not be contiguous when the leaf count is not a
    /// power of two, so this walks the subtree rather than a span.
    fn subtree_valid(&self, i: u64) -> bool {
        let mut stack = vec![i];
        while let Some(node) = stack.pop() {
            match self.shape.children(node) {
                Some((left, right)) => {
                    stack.push(left);
                    stack.push(right);
                }
                None => {
                    let leaf = self
                        .shape
                        .leaf_of_node(node)
                        .expect("node without children is a leaf");
                    if !self.bitmap.get(leaf) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn persist_word(&self, k: u64) -> Result<(), TreeError> {
        let backing = self.backing.lock();
        if let Some(backing) = backing.as_ref() {
            let word = Bitmap::word_index(k);
            let offset = self.shape.node_count() * DIGEST_SIZE as u64 + word as u64 * 8;
            backing.file.write_all_at(&self.bitmap.word_bytes(word), offset)?;
            backing.file.sync_data()?;
        }
        Ok(())
    }
}
