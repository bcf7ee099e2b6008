//! The tile scheduler.
//!
//! # Calling Conventions
//!
//! - [`TileScheduler::compute_blocking`]: fan out over the standard pool and
//!   wait for every tile
//! - [`TileScheduler::schedule`]: return a [`Request`] immediately and report
//!   each tile to listeners
//! - [`TileScheduler::prefetch`]: best-effort work on the low-priority pool
//! - [`TileScheduler::compute_single`]: one tile on the calling thread, with
//!   single-flight de-duplication and out-of-memory recovery
//!
//! # Locking
//!
//! The request tables, the single-flight table and each pool queue have their
//! own locks. None of them is held while calling into the tile source, the
//! cache or a listener.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::cache::TileCache;
use crate::error::{ComputeError, ConfigError, SchedulerError};
use crate::tile::{ImageId, Tile, TileKey, TileSource};

use super::chunk::{ChunkPolicy, DefaultChunkPolicy};
use super::job::{chunk_jobs, Batch, Job, JobId, SingleTileJob};
use super::listener::TileListener;
use super::pool::{Placement, Pool, PoolKind, Submission, MIN_PRIORITY, NORM_PRIORITY};
use super::request::{Request, RequestHandle, TileStatus};
use super::single_flight::{Claim, InFlight};

/// Upper bound on workers per pool accepted from configuration.
pub const MAX_PARALLELISM: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Worker threads for blocking and listener-driven work (0 = synchronous)
    pub standard_parallelism: usize,

    /// Worker threads for prefetch work (0 = synchronous)
    pub prefetch_parallelism: usize,

    /// Standard pool priority, clamped to 1..=10
    pub standard_priority: u8,

    /// Prefetch pool priority, clamped to 1..=10
    pub prefetch_priority: u8,

    /// Maximum wait on another thread's in-flight computation (`None` = unbounded)
    pub single_flight_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            standard_parallelism: 2,
            prefetch_parallelism: 1,
            standard_priority: NORM_PRIORITY,
            prefetch_priority: MIN_PRIORITY,
            single_flight_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("standard_parallelism", self.standard_parallelism),
            ("prefetch_parallelism", self.prefetch_parallelism),
        ] {
            if value > MAX_PARALLELISM {
                return Err(ConfigError::InvalidValue {
                    name,
                    message: format!("{} exceeds the maximum of {}", value, MAX_PARALLELISM),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Error Hook
// =============================================================================

/// Receives failures that survive out-of-memory recovery.
pub trait ErrorHook: Send + Sync {
    fn report(&self, key: TileKey, error: &ComputeError);
}

impl<F> ErrorHook for F
where
    F: Fn(TileKey, &ComputeError) + Send + Sync,
{
    fn report(&self, key: TileKey, error: &ComputeError) {
        self(key, error)
    }
}

/// Default hook: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHook;

impl ErrorHook for LogErrorHook {
    fn report(&self, key: TileKey, error: &ComputeError) {
        error!(tile = %key, %error, "Tile computation failed after memory recovery");
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Default)]
pub(crate) struct RequestTables {
    pub(crate) tile_requests: HashMap<TileKey, Vec<RequestHandle>>,
    pub(crate) tile_jobs: HashMap<TileKey, JobId>,
}

/// State shared by the scheduler handle, its workers and its requests.
pub(crate) struct Shared {
    source: Arc<dyn TileSource>,
    cache: Option<Arc<TileCache>>,
    error_hook: Arc<dyn ErrorHook>,
    chunk_policy: Arc<dyn ChunkPolicy>,
    pub(crate) tables: Mutex<RequestTables>,
    in_flight: InFlight,
    single_flight_timeout: Option<Duration>,
    standard: Pool,
    prefetch: Pool,
    next_job_id: AtomicU64,
    next_request_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Standard => &self.standard,
            PoolKind::Prefetch => &self.prefetch,
        }
    }

    fn next_job_id(&self) -> JobId {
        self.next_job_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run the tile source, turning a panic into an error.
    pub(crate) fn compute_tile(&self, key: TileKey) -> Result<Tile, ComputeError> {
        let TileKey { owner, x, y } = key;
        panic::catch_unwind(AssertUnwindSafe(|| self.source.compute_tile(owner, x, y)))
            .unwrap_or_else(|payload| Err(ComputeError::Panicked(panic_message(&*payload))))
    }

    /// Compute with the out-of-memory ladder: drop the owner's tiles and
    /// retry, then flush the cache and retry once more.
    fn compute_with_recovery(&self, key: TileKey) -> Result<Tile, ComputeError> {
        let first = self.compute_tile(key);
        if !matches!(&first, Err(e) if e.is_out_of_memory()) {
            return first;
        }

        let removed = self
            .cache
            .as_ref()
            .map_or(0, |cache| cache.remove_all(key.owner));
        warn!(tile = %key, removed, "Out of memory, dropped cached tiles of image and retrying");

        let second = self.compute_tile(key);
        if !matches!(&second, Err(e) if e.is_out_of_memory()) {
            return second;
        }

        if let Some(cache) = &self.cache {
            cache.flush();
        }
        warn!(tile = %key, "Out of memory again, flushed tile cache and retrying");

        let third = self.compute_tile(key);
        if let Err(error) = &third {
            self.error_hook.report(key, error);
        }
        third
    }

    /// Run or queue jobs on a pool.
    fn dispatch(&self, kind: PoolKind, jobs: Vec<Job>, placement: Placement) {
        match self.pool(kind).submit(jobs, placement) {
            Submission::Queued => {}
            Submission::Inline(jobs) => {
                for job in jobs {
                    job.run(self);
                }
            }
            Submission::Rejected(jobs) => {
                for job in jobs {
                    job.abort(self, ComputeError::ShutDown);
                }
            }
        }
    }

    /// Withdraw `request` from the given tiles (all of its tiles if empty).
    pub(crate) fn cancel(&self, request: &RequestHandle, indices: &[(i32, i32)]) {
        let targets: Vec<(i32, i32)> = if indices.is_empty() {
            request.tile_indices().to_vec()
        } else {
            indices
                .iter()
                .copied()
                .filter(|&(x, y)| request.contains(x, y))
                .collect()
        };

        let mut cancelled = Vec::new();
        let mut dequeue = Vec::new();
        {
            let mut tables = self.tables.lock();
            for &(x, y) in &targets {
                let key = request.key(x, y);
                let Some(list) = tables.tile_requests.get_mut(&key) else {
                    // Already handed to a worker, or finished
                    continue;
                };
                let Some(pos) = list.iter().position(|r| Arc::ptr_eq(r, request)) else {
                    continue;
                };
                list.remove(pos);
                if list.is_empty() {
                    tables.tile_requests.remove(&key);
                    if let Some(job) = tables.tile_jobs.remove(&key) {
                        dequeue.push(job);
                    }
                }
                cancelled.push((x, y));
            }
        }

        let removed = self.pool(PoolKind::Standard).remove_jobs(&dequeue);
        debug!(
            request = request.id(),
            cancelled = cancelled.len(),
            dequeued = removed,
            "Cancelled request tiles"
        );

        let owner = request.image();
        let affected = std::slice::from_ref(request);
        for &(x, y) in &cancelled {
            request.set_status(x, y, TileStatus::Cancelled);
            for listener in request.listeners() {
                listener.on_tile_cancelled(affected, owner, x, y);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn dedup_indices(indices: &[(i32, i32)]) -> Vec<(i32, i32)> {
    let mut seen = std::collections::HashSet::with_capacity(indices.len());
    indices.iter().copied().filter(|i| seen.insert(*i)).collect()
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`TileScheduler`] with optional collaborators.
pub struct TileSchedulerBuilder {
    source: Arc<dyn TileSource>,
    config: SchedulerConfig,
    cache: Option<Arc<TileCache>>,
    error_hook: Arc<dyn ErrorHook>,
    chunk_policy: Arc<dyn ChunkPolicy>,
}

impl TileSchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache to drop tiles from when the source runs out of memory.
    pub fn cache(mut self, cache: Arc<TileCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn error_hook(mut self, hook: impl ErrorHook + 'static) -> Self {
        self.error_hook = Arc::new(hook);
        self
    }

    pub fn chunk_policy(mut self, policy: impl ChunkPolicy + 'static) -> Self {
        self.chunk_policy = Arc::new(policy);
        self
    }

    /// Validate the configuration and start the worker pools.
    pub fn build(self) -> Result<TileScheduler, ConfigError> {
        self.config.validate()?;

        let shared = Arc::new(Shared {
            source: self.source,
            cache: self.cache,
            error_hook: self.error_hook,
            chunk_policy: self.chunk_policy,
            tables: Mutex::new(RequestTables::default()),
            in_flight: InFlight::default(),
            single_flight_timeout: self.config.single_flight_timeout,
            standard: Pool::new(PoolKind::Standard, self.config.standard_priority),
            prefetch: Pool::new(PoolKind::Prefetch, self.config.prefetch_priority),
            next_job_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        shared
            .standard
            .resize(&shared, self.config.standard_parallelism);
        shared
            .prefetch
            .resize(&shared, self.config.prefetch_parallelism);

        debug!(
            standard = self.config.standard_parallelism,
            prefetch = self.config.prefetch_parallelism,
            "Tile scheduler started"
        );

        Ok(TileScheduler { shared })
    }
}

// =============================================================================
// Tile Scheduler
// =============================================================================

/// Schedules tile computations over a standard and a prefetch worker pool.
///
/// Dropping the scheduler signals its workers to stop without waiting for
/// them; call [`shutdown`](Self::shutdown) to join them.
pub struct TileScheduler {
    shared: Arc<Shared>,
}

impl TileScheduler {
    /// Create a scheduler with the default error hook and chunk policy.
    pub fn new(
        source: impl TileSource + 'static,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(source).config(config).build()
    }

    pub fn builder(source: impl TileSource + 'static) -> TileSchedulerBuilder {
        TileSchedulerBuilder {
            source: Arc::new(source),
            config: SchedulerConfig::default(),
            cache: None,
            error_hook: Arc::new(LogErrorHook),
            chunk_policy: Arc::new(DefaultChunkPolicy),
        }
    }

    /// The cache used for out-of-memory recovery, if any.
    pub fn cache(&self) -> Option<&Arc<TileCache>> {
        self.shared.cache.as_ref()
    }

    fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Compute tiles on the standard pool and wait for all of them.
    ///
    /// Tiles are returned in the order of `indices`. On failure, the error of
    /// the first failing tile is returned once every job of this call has
    /// finished.
    pub fn compute_blocking(
        &self,
        owner: ImageId,
        indices: &[(i32, i32)],
    ) -> Result<Vec<Tile>, SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.shared.standard.parallelism();
        let ranges = self.shared.chunk_policy.plan(indices.len(), workers);
        debug!(
            %owner,
            tiles = indices.len(),
            workers,
            jobs = ranges.len(),
            "Scheduling blocking tiles"
        );

        let batch = Arc::new(Batch::new(indices.len(), ranges.len()));
        let jobs = chunk_jobs(owner, indices, ranges, Some(batch.clone()), || {
            self.shared.next_job_id()
        });
        self.shared
            .dispatch(PoolKind::Standard, jobs, Placement::Append);

        let mut tiles = Vec::with_capacity(indices.len());
        let mut first_error = None;
        for (i, outcome) in batch.wait().into_iter().enumerate() {
            match outcome {
                Some(Ok(tile)) if first_error.is_none() => tiles.push(tile),
                Some(Err(e)) if first_error.is_none() => {
                    let (x, y) = indices[i];
                    first_error = Some(match e {
                        ComputeError::ShutDown => SchedulerError::ShutDown,
                        source => SchedulerError::Compute { owner, x, y, source },
                    });
                }
                _ => {}
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(tiles),
        }
    }

    /// Schedule tiles without blocking; outcomes go to `listeners`.
    ///
    /// A tile already queued for another request is not queued again: this
    /// request joins the existing job and its listeners receive the same
    /// outcome.
    pub fn schedule(
        &self,
        owner: ImageId,
        indices: &[(i32, i32)],
        listeners: Vec<Arc<dyn TileListener>>,
    ) -> RequestHandle {
        let indices = dedup_indices(indices);
        let request = Arc::new(Request::new(
            self.shared.next_request_id.fetch_add(1, Ordering::Relaxed),
            owner,
            indices.clone(),
            listeners,
            Arc::downgrade(&self.shared),
        ));

        let mut jobs = Vec::new();
        let mut joined = 0usize;
        {
            let mut tables = self.shared.tables.lock();
            for &(x, y) in &indices {
                let key = TileKey::new(owner, x, y);
                if let Some(list) = tables.tile_requests.get_mut(&key) {
                    list.push(request.clone());
                    joined += 1;
                    continue;
                }
                let id = self.shared.next_job_id();
                tables.tile_requests.insert(key, vec![request.clone()]);
                tables.tile_jobs.insert(key, id);
                jobs.push(Job::SingleTile(SingleTileJob { id, key }));
            }
        }

        debug!(
            %owner,
            request = request.id(),
            queued = jobs.len(),
            joined,
            "Scheduled tiles"
        );

        if self.is_shut_down() {
            for job in jobs {
                job.abort(&self.shared, ComputeError::ShutDown);
            }
        } else {
            self.shared
                .dispatch(PoolKind::Standard, jobs, Placement::AfterLastChunk);
        }

        request
    }

    /// Compute tiles on the prefetch pool, best effort and without reporting.
    pub fn prefetch(&self, owner: ImageId, indices: &[(i32, i32)]) {
        if self.is_shut_down() || indices.is_empty() {
            return;
        }

        let workers = self.shared.prefetch.parallelism();
        let ranges = self.shared.chunk_policy.plan(indices.len(), workers);
        debug!(%owner, tiles = indices.len(), jobs = ranges.len(), "Prefetching tiles");

        let jobs = chunk_jobs(owner, indices, ranges, None, || self.shared.next_job_id());
        self.shared
            .dispatch(PoolKind::Prefetch, jobs, Placement::Append);
    }

    /// Compute one tile on the calling thread.
    ///
    /// Concurrent calls for the same tile share a single computation. The
    /// computing caller recovers from out-of-memory by dropping cached tiles
    /// of the image, then the whole cache; a failure after that is reported
    /// to the error hook and returned to every caller.
    pub fn compute_single(&self, owner: ImageId, x: i32, y: i32) -> Result<Tile, SchedulerError> {
        let key = TileKey::new(owner, x, y);

        let outcome = match self.shared.in_flight.claim(key) {
            Claim::Leader(guard) => {
                let outcome = self.shared.compute_with_recovery(key);
                guard.publish(outcome.clone());
                outcome
            }
            Claim::Waiter(slot) => {
                debug!(tile = %key, "Waiting on in-flight computation");
                slot.wait(self.shared.single_flight_timeout)
            }
        };

        outcome.map_err(|source| SchedulerError::Compute {
            owner,
            x,
            y,
            source,
        })
    }

    /// Cancel tiles of a request that have not started (all of them if
    /// `indices` is empty).
    ///
    /// Cancelled tiles are reported to the request's own listeners. Tiles
    /// already computing are left alone and reported normally.
    pub fn cancel(&self, request: &RequestHandle, indices: &[(i32, i32)]) {
        self.shared.cancel(request, indices);
    }

    /// Set the number of workers of a pool. Zero runs its work synchronously.
    pub fn set_parallelism(&self, pool: PoolKind, parallelism: usize) {
        self.shared.pool(pool).resize(&self.shared, parallelism);
    }

    pub fn parallelism(&self, pool: PoolKind) -> usize {
        self.shared.pool(pool).parallelism()
    }

    /// Set the thread priority of a pool, clamped to 1..=10.
    pub fn set_priority(&self, pool: PoolKind, priority: u8) {
        self.shared.pool(pool).set_priority(priority);
    }

    pub fn priority(&self, pool: PoolKind) -> u8 {
        self.shared.pool(pool).priority()
    }

    /// Jobs waiting in a pool's queue.
    pub fn queued_jobs(&self, pool: PoolKind) -> usize {
        self.shared.pool(pool).queued_jobs()
    }

    /// Tiles currently being computed through [`compute_single`](Self::compute_single).
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.len()
    }

    fn stop(&self) -> Vec<std::thread::JoinHandle<()>> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut handles = Vec::new();
        for kind in [PoolKind::Standard, PoolKind::Prefetch] {
            let (drained, workers) = self.shared.pool(kind).shutdown();
            if !drained.is_empty() {
                debug!(pool = %kind, jobs = drained.len(), "Discarding queued jobs");
            }
            for job in drained {
                job.abort(&self.shared, ComputeError::ShutDown);
            }
            handles.extend(workers);
        }
        handles
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Queued jobs are discarded: blocking callers get
    /// [`SchedulerError::ShutDown`] and listeners a failure.
    pub fn shutdown(self) {
        for handle in self.stop() {
            if handle.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        debug!("Tile scheduler shut down");
    }
}

impl Drop for TileScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TileScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileScheduler")
            .field("standard", &self.parallelism(PoolKind::Standard))
            .field("prefetch", &self.parallelism(PoolKind::Prefetch))
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
