//! Units of scheduled work.
//!
//! A [`Job`] is either a single listener-bearing tile, de-duplicated across
//! requests through the scheduler's request tables, or a chunk of contiguous
//! tiles computed sequentially by one worker.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::ComputeError;
use crate::tile::{ImageId, Tile, TileKey};

use super::listener::distinct_listeners;
use super::request::{RequestHandle, TileStatus};
use super::tile_scheduler::Shared;

pub(crate) type JobId = u64;

type Outcome = Result<Tile, ComputeError>;

pub(crate) enum Job {
    SingleTile(SingleTileJob),
    Chunk(ChunkJob),
}

impl Job {
    pub(crate) fn id(&self) -> JobId {
        match self {
            Job::SingleTile(job) => job.id,
            Job::Chunk(job) => job.id,
        }
    }

    pub(crate) fn is_chunk(&self) -> bool {
        matches!(self, Job::Chunk(_))
    }

    /// Execute the job on the current thread.
    pub(crate) fn run(self, shared: &Shared) {
        match self {
            Job::SingleTile(job) => job.run(shared),
            Job::Chunk(job) => job.run(shared),
        }
    }

    /// Complete the job without computing anything.
    pub(crate) fn abort(self, shared: &Shared, error: ComputeError) {
        match self {
            Job::SingleTile(job) => job.abort(shared, error),
            Job::Chunk(job) => job.abort(error),
        }
    }
}

// =============================================================================
// Single Tile Job
// =============================================================================

/// One tile whose outcome goes to every request waiting on it.
///
/// The requests themselves live in the scheduler's tile-to-requests table so
/// later requests for the same tile can attach while the job is queued.
pub(crate) struct SingleTileJob {
    pub(crate) id: JobId,
    pub(crate) key: TileKey,
}

impl SingleTileJob {
    /// Detach the waiting requests from the scheduler tables.
    fn take_requests(&self, shared: &Shared) -> Option<Vec<RequestHandle>> {
        let mut tables = shared.tables.lock();
        if tables.tile_jobs.get(&self.key) == Some(&self.id) {
            tables.tile_jobs.remove(&self.key);
        }
        tables.tile_requests.remove(&self.key)
    }

    fn run(self, shared: &Shared) {
        let Some(requests) = self.take_requests(shared) else {
            // Every request was cancelled after the job was handed out
            trace!(tile = %self.key, "Skipping tile with no remaining requests");
            return;
        };

        let TileKey { owner, x, y } = self.key;
        for request in &requests {
            request.set_status(x, y, TileStatus::Processing);
        }

        let outcome = shared.compute_tile(self.key);
        notify(&requests, owner, x, y, &outcome);
    }

    fn abort(self, shared: &Shared, error: ComputeError) {
        if let Some(requests) = self.take_requests(shared) {
            let TileKey { owner, x, y } = self.key;
            notify(&requests, owner, x, y, &Err(error));
        }
    }
}

fn notify(requests: &[RequestHandle], owner: ImageId, x: i32, y: i32, outcome: &Outcome) {
    let status = match outcome {
        Ok(_) => TileStatus::Computed,
        Err(_) => TileStatus::Failed,
    };
    for request in requests {
        request.set_status(x, y, status);
    }

    for listener in distinct_listeners(requests) {
        match outcome {
            Ok(tile) => listener.on_tile_computed(requests, owner, x, y, tile),
            Err(error) => listener.on_tile_failed(requests, owner, x, y, error),
        }
    }
}

// =============================================================================
// Chunk Job
// =============================================================================

/// Contiguous run of tiles computed in order by one worker.
///
/// A failure stops the chunk; its remaining tiles are left unattempted.
pub(crate) struct ChunkJob {
    pub(crate) id: JobId,
    pub(crate) owner: ImageId,
    pub(crate) tiles: Vec<(i32, i32)>,
    /// Position of the first tile in the batch's result vector
    pub(crate) offset: usize,
    /// Completion latch of the blocking call; `None` for prefetch
    pub(crate) batch: Option<Arc<Batch>>,
}

impl ChunkJob {
    fn run(self, shared: &Shared) {
        let mut outcomes = Vec::with_capacity(self.tiles.len());

        for &(x, y) in &self.tiles {
            let outcome = shared.compute_tile(TileKey::new(self.owner, x, y));
            let failed = outcome.is_err();
            if let Err(error) = &outcome {
                if self.batch.is_none() {
                    debug!(owner = %self.owner, x, y, %error, "Prefetch tile failed");
                }
            }
            outcomes.push(outcome);
            if failed {
                break;
            }
        }

        if let Some(batch) = &self.batch {
            batch.complete(self.offset, outcomes);
        }
    }

    fn abort(self, error: ComputeError) {
        if let Some(batch) = &self.batch {
            batch.complete(self.offset, vec![Err(error)]);
        }
    }
}

// =============================================================================
// Batch Latch
// =============================================================================

struct BatchState {
    results: Vec<Option<Outcome>>,
    pending_jobs: usize,
}

/// Collects the chunk results of one blocking call and wakes the caller once
/// every chunk has reported.
pub(crate) struct Batch {
    state: Mutex<BatchState>,
    done: Condvar,
}

impl Batch {
    pub(crate) fn new(tiles: usize, jobs: usize) -> Self {
        Self {
            state: Mutex::new(BatchState {
                results: vec![None; tiles],
                pending_jobs: jobs,
            }),
            done: Condvar::new(),
        }
    }

    /// Record the outcomes of one chunk starting at `offset`.
    pub(crate) fn complete(&self, offset: usize, outcomes: Vec<Outcome>) {
        let mut state = self.state.lock();
        for (slot, outcome) in state.results[offset..].iter_mut().zip(outcomes) {
            *slot = Some(outcome);
        }
        state.pending_jobs = state.pending_jobs.saturating_sub(1);
        if state.pending_jobs == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every chunk has completed and return per-tile outcomes.
    ///
    /// `None` marks a tile skipped after an earlier failure in its chunk.
    pub(crate) fn wait(&self) -> Vec<Option<Outcome>> {
        let mut state = self.state.lock();
        while state.pending_jobs > 0 {
            self.done.wait(&mut state);
        }
        std::mem::take(&mut state.results)
    }
}

/// Range of tiles covered by each chunk, paired with its result offset.
pub(crate) fn chunk_jobs(
    owner: ImageId,
    indices: &[(i32, i32)],
    ranges: Vec<Range<usize>>,
    batch: Option<Arc<Batch>>,
    mut next_id: impl FnMut() -> JobId,
) -> Vec<Job> {
    ranges
        .into_iter()
        .map(|range| {
            Job::Chunk(ChunkJob {
                id: next_id(),
                owner,
                offset: range.start,
                tiles: indices[range].to_vec(),
                batch: batch.clone(),
            })
        })
        .collect()
}
