//! The authoritative tree: every leaf hash known and trusted, used as
//! the verification oracle for incoming chunks.

use std::fs;
use std::io::{BufReader, Read as _};

use camino::Utf8Path;
use mirror_primitives::{Digest, Shape};
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::engine::{build_nodes, leaf_digest, leaf_digests, node_digest};
use crate::error::TreeError;
use crate::image::{quarantine, read_image, write_image};
use crate::proof::{path_proof_from_nodes, ProofStep};

#[derive(Clone, Debug)]
pub struct ReferenceTree {
    shape: Shape,
    nodes: Vec<Digest>,
}

impl ReferenceTree {
    /// Computes every leaf and internal hash of `source` under an
    /// explicit shape.
    pub fn build(shape: Shape, source: &[u8]) -> Result<Self, TreeError> {
        let nodes = build_nodes(&shape, leaf_digests(&shape, source)?)?;
        Ok(Self { shape, nodes })
    }

    /// Like [`ReferenceTree::build`] with the automatic chunk-size
    /// policy applied to the source length.
    pub fn build_from_bytes(source: &[u8]) -> Result<Self, TreeError> {
        let shape = Shape::from_content_size(source.len() as u64)?;
        Self::build(shape, source)
    }

    /// Streams an on-disk artifact chunk by chunk, so artifacts never
    /// have to fit in memory.
    pub fn build_from_file(path: &Utf8Path) -> Result<Self, TreeError> {
        let file = fs::File::open(path)?;
        let shape = Shape::from_content_size(file.metadata()?.len())?;

        let mut reader = BufReader::new(file);
        let mut buf = vec![0_u8; shape.chunk_size() as usize];
        let mut leaves = Vec::with_capacity(shape.leaf_count() as usize);
        for k in 0..shape.leaf_count() {
            let len = shape.leaf_len(k) as usize;
            reader.read_exact(&mut buf[..len])?;
            leaves.push(leaf_digest(&buf[..len]));
        }

        let nodes = build_nodes(&shape, leaves)?;
        debug!(total = %shape.total_content_size(), leaves = %shape.leaf_count(), "Built reference tree");
        Ok(Self { shape, nodes })
    }

    pub(crate) fn from_parts(shape: Shape, nodes: Vec<Digest>) -> Self {
        Self { shape, nodes }
    }

    /// Parses a reference tree out of serialized tree-file bytes, e.g.
    /// a sidecar fetched over the network.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self, TreeError> {
        let image = crate::image::parse_image(bytes)?;
        if !image.bitmap.is_full() {
            return Err(TreeError::Corrupt(
                "reference tree bytes carry a partial bitmap".to_owned(),
            ));
        }
        Ok(Self::from_parts(image.shape, image.nodes))
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn root(&self) -> Digest {
        self.nodes[0]
    }

    pub(crate) fn nodes(&self) -> &[Digest] {
        &self.nodes
    }

    pub fn hash_of_leaf(&self, k: u64) -> Result<Digest, TreeError> {
        if k >= self.shape.leaf_count() {
            return Err(TreeError::LeafOutOfRange {
                leaf: k,
                leaf_count: self.shape.leaf_count(),
            });
        }
        Ok(self.nodes[self.shape.node_index(k) as usize])
    }

    pub fn hash_of_node(&self, i: u64) -> Result<Digest, TreeError> {
        if i >= self.shape.node_count() {
            return Err(TreeError::OutOfRange {
                index: i,
                node_count: self.shape.node_count(),
            });
        }
        Ok(self.nodes[i as usize])
    }

    /// Checks the parent invariant over the whole array.
    pub fn verify(&self) -> Result<(), TreeError> {
        for i in 0..self.shape.internal_count() {
            let (left, right) = self.shape.children(i).expect("internal node");
            let expected = node_digest(&self.nodes[left as usize], &self.nodes[right as usize]);
            if self.nodes[i as usize] != expected {
                return Err(TreeError::Corrupt(format!(
                    "internal node {i} does not hash its children"
                )));
            }
        }
        Ok(())
    }

    /// Sibling hashes from leaf `k` to the root.
    pub fn path_proof(&self, k: u64) -> Result<Vec<ProofStep>, TreeError> {
        path_proof_from_nodes(&self.shape, &self.nodes, k)
    }

    pub fn load(path: &Utf8Path) -> Result<Self, TreeError> {
        let image = read_image(path)?;
        if !image.bitmap.is_full() {
            return Err(TreeError::Corrupt(format!(
                "expected a reference tree, but only {} of {} leaves are marked valid",
                image.bitmap.count_ones(),
                image.shape.leaf_count()
            )));
        }
        Ok(Self::from_parts(image.shape, image.nodes))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), TreeError> {
        let bitmap = Bitmap::full(self.shape.leaf_count());
        write_image(path, &self.shape, &self.nodes, &bitmap.to_bytes())
    }

    /// Loads the tree at `tree_path`, rebuilding from the artifact when
    /// the tree file is missing, corrupt, or older than the artifact.
    pub fn load_or_build(artifact: &Utf8Path, tree_path: &Utf8Path) -> Result<Self, TreeError> {
        if tree_path.exists() {
            let tree_mtime = fs::metadata(tree_path.as_std_path())?.modified()?;
            let artifact_mtime = fs::metadata(artifact.as_std_path())?.modified()?;

            if artifact_mtime <= tree_mtime {
                match Self::load(tree_path) {
                    Ok(tree) => return Ok(tree),
                    Err(TreeError::Corrupt(reason)) => {
                        warn!(%tree_path, %reason, "Reference tree unreadable, rebuilding");
                        quarantine(tree_path)?;
                    }
                    Err(err) => return Err(err),
                }
            } else {
                info!(%artifact, %tree_path, "Artifact newer than tree file, rebuilding");
            }
        }

        let tree = Self::build_from_file(artifact)?;
        tree.save(tree_path)?;
        Ok(tree)
    }
}
