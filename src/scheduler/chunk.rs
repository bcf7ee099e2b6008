//! Partitioning of bulk tile requests into chunk jobs.

use std::fmt;
use std::ops::Range;

/// Splits `total` tiles into contiguous ranges, one chunk job per range.
///
/// Returned ranges must be non-empty, contiguous, in order, and cover
/// `0..total` exactly.
pub trait ChunkPolicy: Send + Sync {
    fn plan(&self, total: usize, workers: usize) -> Vec<Range<usize>>;
}

/// The default chunking heuristic.
///
/// With no more tiles than workers, every tile gets its own job. Otherwise
/// each chunk takes about `remaining / (2 * workers)` tiles, never fewer than a
/// minimum derived from the total, and the last chunk absorbs any remainder
/// smaller than that minimum. A single worker gets one chunk holding every
/// tile.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultChunkPolicy;

impl DefaultChunkPolicy {
    fn min_chunk(total: usize, workers: usize, fraction: f64) -> usize {
        if workers == 1 {
            return total;
        }
        let derived = (fraction * total as f64 / 2.0 + 0.5) as usize;
        derived.max(1).min(total)
    }
}

impl ChunkPolicy for DefaultChunkPolicy {
    fn plan(&self, total: usize, workers: usize) -> Vec<Range<usize>> {
        let workers = workers.max(1);
        if total == 0 {
            return Vec::new();
        }
        if total <= workers {
            return (0..total).map(|i| i..i + 1).collect();
        }

        let fraction = 1.0 / (2.0 * workers as f64);
        let min_chunk = Self::min_chunk(total, workers, fraction);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut left = total;

        while left > 0 {
            let mut size = ((fraction * left as f64 + 0.5) as usize)
                .max(min_chunk)
                .min(left);
            left -= size;
            if left < min_chunk {
                size += left;
                left = 0;
            }
            chunks.push(start..start + size);
            start += size;
        }

        chunks
    }
}

impl fmt::Display for DefaultChunkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("default")
    }
}
