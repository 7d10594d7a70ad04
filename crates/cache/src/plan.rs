//! Pure transfer planning: which leaves are missing, how they group
//! into ranged requests, and how large a request should be given the
//! current load.

use std::ops::RangeInclusive;

use mirror_primitives::Shape;

/// Granularity unit of the adaptive sizing table.
pub const XFER_UNIT: u64 = 64 * 1024;

/// One contiguous ranged request covering whole chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub from_leaf: u64,
    pub to_leaf: u64,
    pub byte_begin: u64,
    pub byte_end: u64,
}

impl Transfer {
    fn over(shape: &Shape, from_leaf: u64, to_leaf: u64) -> Self {
        let (byte_begin, _) = shape.chunk_range(from_leaf);
        let (_, byte_end) = shape.chunk_range(to_leaf);
        Self {
            from_leaf,
            to_leaf,
            byte_begin,
            byte_end,
        }
    }

    pub const fn size(&self) -> u64 {
        self.byte_end - self.byte_begin
    }

    pub const fn leaves(&self) -> RangeInclusive<u64> {
        self.from_leaf..=self.to_leaf
    }
}

/// Leaves overlapping `[lo, hi)` for which `is_valid` is false, in
/// ascending order.
pub fn missing_in_range(
    shape: &Shape,
    lo: u64,
    hi: u64,
    is_valid: impl Fn(u64) -> bool,
) -> Vec<u64> {
    let Some((from, to)) = shape.leaves_covering(lo, hi) else {
        return Vec::new();
    };
    (from..=to).filter(|&k| !is_valid(k)).collect()
}

/// Groups missing leaves into transfers of at most `max_xfer` bytes.
///
/// Adjacent missing leaves extend the current transfer; small gaps of
/// already-valid leaves (up to `min_xfer / chunk_size`, at least one
/// chunk) are covered rather than split on, trading a re-download for
/// fewer requests. An undersized final transfer is merged back into its
/// predecessor when the merged span still fits `max_xfer`.
pub fn coalesce(shape: &Shape, missing: &[u64], min_xfer: u64, max_xfer: u64) -> Vec<Transfer> {
    debug_assert!(missing.windows(2).all(|pair| pair[0] < pair[1]));

    let gap_limit = (min_xfer / shape.chunk_size()).max(1);
    let mut spans: Vec<(u64, u64)> = Vec::new();

    for &k in missing {
        if let Some((from, to)) = spans.last_mut() {
            let gap = k - *to - 1;
            let extended = Transfer::over(shape, *from, k);
            if gap <= gap_limit && extended.size() <= max_xfer {
                *to = k;
                continue;
            }
        }
        spans.push((k, k));
    }

    if spans.len() >= 2 {
        let (last_from, last_to) = *spans.last().expect("len checked");
        if Transfer::over(shape, last_from, last_to).size() < min_xfer {
            let (prev_from, _) = spans[spans.len() - 2];
            if Transfer::over(shape, prev_from, last_to).size() <= max_xfer {
                let _ = spans.pop();
                spans.last_mut().expect("len checked").1 = last_to;
            }
        }
    }

    spans
        .into_iter()
        .map(|(from, to)| Transfer::over(shape, from, to))
        .collect()
}

/// Target transfer size for a given number of active transfers.
///
/// A step function over the load table: generous when idle, small when
/// saturated, always clamped to `[min_xfer, max_xfer]`. Monotonically
/// non-increasing in `active`.
pub fn target_xfer_bytes(active: usize, min_xfer: u64, max_xfer: u64) -> u64 {
    // (active transfers, numerator, denominator) of a XFER_UNIT factor.
    const TABLE: &[(usize, u64, u64)] = &[
        (0, 1024, 1),
        (4, 64, 1),
        (8, 4, 1),
        (12, 1, 4),
        (15, 3, 100),
    ];

    let mut factor = (TABLE[0].1, TABLE[0].2);
    for &(threshold, num, den) in TABLE {
        if active >= threshold {
            factor = (num, den);
        }
    }

    (XFER_UNIT * factor.0 / factor.1).clamp(min_xfer, max_xfer)
}
