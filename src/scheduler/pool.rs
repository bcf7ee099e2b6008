//! Worker thread pools.
//!
//! Each pool owns a job queue and a set of long-lived worker threads that
//! block on it. Shrinking a pool appends stop sentinels that idle workers
//! consume; growing spawns workers immediately. A pool with no workers is
//! synchronous: submitted jobs are handed back for the caller to run.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error};

use super::job::{Job, JobId};
use super::tile_scheduler::Shared;

/// Lowest thread priority.
pub const MIN_PRIORITY: u8 = 1;
/// Default priority of the standard pool.
pub const NORM_PRIORITY: u8 = 5;
/// Highest thread priority.
pub const MAX_PRIORITY: u8 = 10;

/// Clamp a priority into `MIN_PRIORITY..=MAX_PRIORITY`.
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// Which of the scheduler's two pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolKind {
    /// Blocking and listener-driven work
    Standard,
    /// Best-effort prefetch work
    Prefetch,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Standard => f.write_str("standard"),
            PoolKind::Prefetch => f.write_str("prefetch"),
        }
    }
}

/// Where submitted jobs enter the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// At the tail
    Append,
    /// Right after the last queued chunk job, or at the head if there is none
    AfterLastChunk,
}

/// Result of [`Pool::submit`].
pub(crate) enum Submission {
    Queued,
    /// The pool has no workers; run these on the calling thread
    Inline(Vec<Job>),
    /// The pool is shut down
    Rejected(Vec<Job>),
}

enum QueueItem {
    Job(Job),
    Terminate,
}

struct PoolState {
    queue: VecDeque<QueueItem>,
    workers: HashMap<usize, JoinHandle<()>>,
    parallelism: usize,
    next_worker_id: usize,
    shut_down: bool,
}

pub(crate) struct Pool {
    kind: PoolKind,
    state: Mutex<PoolState>,
    available: Condvar,
    priority: AtomicU8,
}

impl Pool {
    pub(crate) fn new(kind: PoolKind, priority: u8) -> Self {
        Self {
            kind,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: HashMap::new(),
                parallelism: 0,
                next_worker_id: 0,
                shut_down: false,
            }),
            available: Condvar::new(),
            priority: AtomicU8::new(clamp_priority(priority)),
        }
    }

    /// Configured worker count.
    pub(crate) fn parallelism(&self) -> usize {
        self.state.lock().parallelism
    }

    /// Workers that have not yet consumed a stop sentinel.
    pub(crate) fn live_workers(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub(crate) fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    /// Set the priority; each worker applies it before its next job.
    pub(crate) fn set_priority(&self, priority: u8) {
        let priority = clamp_priority(priority);
        self.priority.store(priority, Ordering::Release);
        debug!(pool = %self.kind, priority, "Pool priority changed");
    }

    /// Number of jobs waiting in the queue.
    pub(crate) fn queued_jobs(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|item| matches!(item, QueueItem::Job(_)))
            .count()
    }

    /// Grow or shrink the pool to `parallelism` workers.
    pub(crate) fn resize(&self, shared: &Arc<Shared>, parallelism: usize) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }

        let current = state.parallelism;
        if parallelism > current {
            for _ in current..parallelism {
                let id = state.next_worker_id;
                state.next_worker_id += 1;

                let worker_shared = shared.clone();
                let kind = self.kind;
                let spawned = thread::Builder::new()
                    .name(format!("tile-{}-{}", kind, id))
                    .spawn(move || worker_loop(worker_shared, kind, id));

                match spawned {
                    Ok(handle) => {
                        state.workers.insert(id, handle);
                        state.parallelism += 1;
                    }
                    Err(e) => {
                        error!(pool = %self.kind, error = %e, "Failed to spawn worker thread");
                        break;
                    }
                }
            }
        } else {
            for _ in parallelism..current {
                state.queue.push_back(QueueItem::Terminate);
            }
            state.parallelism = parallelism;
            self.available.notify_all();
        }

        debug!(
            pool = %self.kind,
            from = current,
            to = state.parallelism,
            "Pool resized"
        );
    }

    /// Hand jobs to the pool.
    pub(crate) fn submit(&self, jobs: Vec<Job>, placement: Placement) -> Submission {
        let mut state = self.state.lock();
        if state.shut_down {
            return Submission::Rejected(jobs);
        }
        if state.parallelism == 0 {
            return Submission::Inline(jobs);
        }

        match placement {
            Placement::Append => {
                state.queue.extend(jobs.into_iter().map(QueueItem::Job));
            }
            Placement::AfterLastChunk => {
                let at = state
                    .queue
                    .iter()
                    .rposition(|item| matches!(item, QueueItem::Job(job) if job.is_chunk()))
                    .map_or(0, |pos| pos + 1);
                for (i, job) in jobs.into_iter().enumerate() {
                    state.queue.insert(at + i, QueueItem::Job(job));
                }
            }
        }

        self.available.notify_all();
        Submission::Queued
    }

    /// Remove queued jobs by id, returning how many were found.
    pub(crate) fn remove_jobs(&self, ids: &[JobId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut state = self.state.lock();
        let before = state.queue.len();
        state
            .queue
            .retain(|item| !matches!(item, QueueItem::Job(job) if ids.contains(&job.id())));
        before - state.queue.len()
    }

    /// Stop accepting work, drain the queue and signal every worker to stop.
    ///
    /// Returns the drained jobs and the join handles of the workers.
    pub(crate) fn shutdown(&self) -> (Vec<Job>, Vec<JoinHandle<()>>) {
        let mut state = self.state.lock();
        state.shut_down = true;

        let drained = state
            .queue
            .drain(..)
            .filter_map(|item| match item {
                QueueItem::Job(job) => Some(job),
                QueueItem::Terminate => None,
            })
            .collect();

        let handles: Vec<JoinHandle<()>> = state.workers.drain().map(|(_, h)| h).collect();
        for _ in 0..handles.len() {
            state.queue.push_back(QueueItem::Terminate);
        }
        state.parallelism = 0;
        self.available.notify_all();

        (drained, handles)
    }
}

fn worker_loop(shared: Arc<Shared>, kind: PoolKind, id: usize) {
    let pool = shared.pool(kind);
    let mut applied: Option<u8> = None;
    debug!(pool = %kind, worker = id, "Worker started");

    loop {
        let item = {
            let mut state = pool.state.lock();
            loop {
                if let Some(item) = state.queue.pop_front() {
                    break item;
                }
                pool.available.wait(&mut state);
            }
        };

        let job = match item {
            QueueItem::Job(job) => job,
            QueueItem::Terminate => {
                pool.state.lock().workers.remove(&id);
                debug!(pool = %kind, worker = id, "Worker stopped");
                return;
            }
        };

        let priority = pool.priority();
        if applied != Some(priority) {
            apply_thread_priority(kind, priority);
            applied = Some(priority);
        }

        let job_id = job.id();
        if panic::catch_unwind(AssertUnwindSafe(|| job.run(&shared))).is_err() {
            error!(pool = %kind, worker = id, job = job_id, "Job panicked");
        }
    }
}

/// Map a 1..=10 priority onto a nice value; normal priority is nice 0.
fn nice_value(priority: u8) -> i32 {
    ((NORM_PRIORITY as i32 - clamp_priority(priority) as i32) * 2).clamp(-20, 19)
}

#[cfg(target_os = "linux")]
fn apply_thread_priority(kind: PoolKind, priority: u8) {
    let nice = nice_value(priority);
    // SAFETY: gettid has no preconditions; setpriority only reads its scalar
    // arguments and affects the calling thread.
    let result = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };
    if result != 0 {
        debug!(
            pool = %kind,
            priority,
            nice,
            error = %std::io::Error::last_os_error(),
            "Could not apply thread priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_thread_priority(kind: PoolKind, priority: u8) {
    debug!(pool = %kind, priority, "Thread priority recorded but not applied on this platform");
}
