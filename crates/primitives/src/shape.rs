use thiserror::Error;

/// Smallest chunk size the automatic policy will pick.
pub const MIN_CHUNK_SIZE: u64 = 1 << 20;

/// Upper bound on the number of leaves produced by the automatic
/// chunk-size policy. Doubling the chunk size halves the leaf count, so
/// the policy walks powers of two upward until it fits.
pub const LEAF_CAP: u64 = 65_536;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShapeError {
    #[error("content size must be non-zero")]
    EmptyContent,

    #[error("chunk size must be a non-zero power of two, got {0}")]
    InvalidChunkSize(u64),
}

/// Pure geometry of a chunked file and its heap-arranged hash tree.
///
/// The tree is a complete binary tree stored as a flat array in heap
/// order: internal nodes occupy `[0, leaf_count - 1)`, leaves occupy
/// `[leaf_count - 1, 2 * leaf_count - 1)`. Leaf `k` covers the byte
/// range `[k * chunk_size, min((k + 1) * chunk_size, total))`; only the
/// last leaf may be short.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape {
    total_content_size: u64,
    chunk_size: u64,
}

impl Shape {
    /// Derives a shape from the content size alone, choosing the
    /// smallest power-of-two chunk size of at least [`MIN_CHUNK_SIZE`]
    /// that keeps the leaf count within [`LEAF_CAP`].
    pub fn from_content_size(total_content_size: u64) -> Result<Self, ShapeError> {
        if total_content_size == 0 {
            return Err(ShapeError::EmptyContent);
        }

        let mut chunk_size = MIN_CHUNK_SIZE;
        while total_content_size.div_ceil(chunk_size) > LEAF_CAP {
            chunk_size *= 2;
        }

        Ok(Self {
            total_content_size,
            chunk_size,
        })
    }

    /// Builds a shape with an explicit chunk size, as persisted in a
    /// tree file footer.
    pub fn with_chunk_size(total_content_size: u64, chunk_size: u64) -> Result<Self, ShapeError> {
        if total_content_size == 0 {
            return Err(ShapeError::EmptyContent);
        }
        if chunk_size == 0 || !chunk_size.is_power_of_two() {
            return Err(ShapeError::InvalidChunkSize(chunk_size));
        }

        Ok(Self {
            total_content_size,
            chunk_size,
        })
    }

    pub const fn total_content_size(&self) -> u64 {
        self.total_content_size
    }

    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub const fn leaf_count(&self) -> u64 {
        self.total_content_size.div_ceil(self.chunk_size)
    }

    pub const fn internal_count(&self) -> u64 {
        self.leaf_count() - 1
    }

    pub const fn node_count(&self) -> u64 {
        2 * self.leaf_count() - 1
    }

    /// Index of the first leaf in the heap array.
    pub const fn first_leaf_index(&self) -> u64 {
        self.internal_count()
    }

    /// The leaf whose chunk contains `byte_offset`.
    pub const fn leaf_of_offset(&self, byte_offset: u64) -> u64 {
        byte_offset / self.chunk_size
    }

    /// Byte range `[start, end)` covered by leaf `k`.
    pub fn chunk_range(&self, k: u64) -> (u64, u64) {
        let start = k * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_content_size);
        (start, end)
    }

    /// Byte length of leaf `k`'s chunk. Only the last leaf may be
    /// shorter than the chunk size.
    pub fn leaf_len(&self, k: u64) -> u64 {
        let (start, end) = self.chunk_range(k);
        end - start
    }

    /// Inclusive leaf range covering the byte range `[lo, hi)`, with
    /// `hi` clamped to the content size. `None` when the range is
    /// empty.
    pub fn leaves_covering(&self, lo: u64, hi: u64) -> Option<(u64, u64)> {
        let hi = hi.min(self.total_content_size);
        if lo >= hi {
            return None;
        }
        Some((self.leaf_of_offset(lo), self.leaf_of_offset(hi - 1)))
    }

    /// Heap array index of leaf `k`.
    pub const fn node_index(&self, k: u64) -> u64 {
        self.first_leaf_index() + k
    }

    /// Leaf number of node `i`, or `None` for internal nodes.
    pub fn leaf_of_node(&self, i: u64) -> Option<u64> {
        i.checked_sub(self.first_leaf_index())
    }

    pub fn is_leaf(&self, i: u64) -> bool {
        i >= self.first_leaf_index()
    }

    pub fn parent(&self, i: u64) -> Option<u64> {
        if i == 0 {
            return None;
        }
        Some((i - 1) / 2)
    }

    /// Children of internal node `i`; leaves have none.
    pub fn children(&self, i: u64) -> Option<(u64, u64)> {
        if self.is_leaf(i) {
            return None;
        }
        Some((2 * i + 1, 2 * i + 2))
    }

    /// Sibling of node `i`; the root has none. The node count is odd,
    /// so every non-root node has an in-bounds sibling.
    pub fn sibling(&self, i: u64) -> Option<u64> {
        if i == 0 {
            return None;
        }
        if i % 2 == 1 {
            Some(i + 1)
        } else {
            Some(i - 1)
        }
    }

    /// Node indices from leaf `k` up to and including the root.
    pub fn path_to_root(&self, k: u64) -> Vec<u64> {
        let mut path = Vec::new();
        let mut node = self.node_index(k);
        path.push(node);
        while let Some(parent) = self.parent(node) {
            path.push(parent);
            node = parent;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    #[test]
    fn single_chunk_file() {
        let shape = Shape::from_content_size(MIB).unwrap();

        assert_eq!(shape.chunk_size(), MIB);
        assert_eq!(shape.leaf_count(), 1);
        assert_eq!(shape.node_count(), 1);
        assert_eq!(shape.first_leaf_index(), 0);
        assert_eq!(shape.chunk_range(0), (0, MIB));
    }

    #[test]
    fn eight_chunk_file() {
        let shape = Shape::from_content_size(8 * MIB).unwrap();

        assert_eq!(shape.chunk_size(), MIB);
        assert_eq!(shape.leaf_count(), 8);
        assert_eq!(shape.internal_count(), 7);
        assert_eq!(shape.node_count(), 15);
        assert_eq!(shape.first_leaf_index(), 7);
        assert_eq!(shape.node_index(0), 7);
        assert_eq!(shape.node_index(7), 14);
    }

    #[test]
    fn chunk_size_policy_holds_around_small_content() {
        for size in [5 * MIB, 12 * MIB + 7, 20 * MIB] {
            let shape = Shape::from_content_size(size).unwrap();
            assert_eq!(shape.chunk_size(), MIB, "content size {size}");
        }
    }

    #[test]
    fn chunk_size_policy_scales_past_the_leaf_cap() {
        let at_cap = LEAF_CAP * MIB;
        assert_eq!(Shape::from_content_size(at_cap).unwrap().chunk_size(), MIB);

        let past_cap = LEAF_CAP * MIB + 1;
        assert_eq!(
            Shape::from_content_size(past_cap).unwrap().chunk_size(),
            2 * MIB
        );
    }

    #[test]
    fn empty_content_is_rejected() {
        assert!(matches!(
            Shape::from_content_size(0),
            Err(ShapeError::EmptyContent)
        ));
    }

    #[test]
    fn explicit_chunk_size_must_be_a_power_of_two() {
        assert!(Shape::with_chunk_size(1024, 24).is_err());
        assert!(Shape::with_chunk_size(1024, 0).is_err());
        assert!(Shape::with_chunk_size(1024, 256).is_ok());
    }

    #[test]
    fn partial_last_leaf() {
        let chunk = 1024;
        let shape = Shape::with_chunk_size(5 * chunk + 5, chunk).unwrap();

        assert_eq!(shape.leaf_count(), 6);
        assert_eq!(shape.leaf_len(4), chunk);
        assert_eq!(shape.leaf_len(5), 5);
        assert_eq!(shape.chunk_range(5), (5 * chunk, 5 * chunk + 5));
    }

    #[test]
    fn leaves_covering_clamps_and_rejects_empty() {
        let shape = Shape::with_chunk_size(5 * 1024 + 5, 1024).unwrap();

        assert_eq!(shape.leaves_covering(0, 1), Some((0, 0)));
        assert_eq!(shape.leaves_covering(1023, 1025), Some((0, 1)));
        assert_eq!(shape.leaves_covering(0, u64::MAX), Some((0, 5)));
        assert_eq!(shape.leaves_covering(4096, 4096), None);
        assert_eq!(shape.leaves_covering(u64::MAX, u64::MAX), None);
    }

    #[test]
    fn heap_arithmetic_round_trips() {
        let shape = Shape::from_content_size(8 * MIB).unwrap();

        for k in 0..shape.leaf_count() {
            let node = shape.node_index(k);
            assert!(shape.is_leaf(node));
            assert_eq!(shape.leaf_of_node(node), Some(k));
        }

        for i in 0..shape.internal_count() {
            let (left, right) = shape.children(i).unwrap();
            assert_eq!(shape.parent(left), Some(i));
            assert_eq!(shape.parent(right), Some(i));
            assert_eq!(shape.sibling(left), Some(right));
            assert_eq!(shape.sibling(right), Some(left));
            assert!(left < shape.node_count());
            assert!(right < shape.node_count());
        }
    }

    #[test]
    fn path_to_root_ends_at_zero() {
        let shape = Shape::from_content_size(8 * MIB).unwrap();

        let path = shape.path_to_root(3);
        assert_eq!(path.first(), Some(&shape.node_index(3)));
        assert_eq!(path.last(), Some(&0));
        assert_eq!(path.len(), 4);

        let single = Shape::from_content_size(MIB).unwrap();
        assert_eq!(single.path_to_root(0), vec![0]);
    }
}
