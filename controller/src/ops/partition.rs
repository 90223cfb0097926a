//! Round-based sequence partitioning for scatter.
//!
//! For `q` parts of a sequence of length `L`, the first `L mod q` parts get
//! `L div q + 1` elements and the rest get `L div q`. Boundaries are prefix
//! sums of those sizes in part order.

use std::ops::Range;

/// Sizes of each part.
#[must_use]
pub fn partition_sizes(len: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = len / parts;
    let remainder = len % parts;
    (0..parts)
        .map(|index| if index < remainder { base + 1 } else { base })
        .collect()
}

/// Index range of each part.
#[must_use]
pub fn partition_bounds(len: usize, parts: usize) -> Vec<Range<usize>> {
    let mut start = 0;
    partition_sizes(len, parts)
        .into_iter()
        .map(|size| {
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// Splits `items` into `parts` contiguous partitions.
#[must_use]
pub fn partition<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    partition_bounds(items.len(), parts)
        .into_iter()
        .map(|range| items[range].to_vec())
        .collect()
}
