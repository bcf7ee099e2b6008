//! Per-tile single-flight coordination.
//!
//! The first caller to claim a tile becomes its leader and computes it; later
//! callers for the same tile wait on the leader's result slot. The leader
//! always publishes: if it unwinds before doing so, its guard publishes
//! [`ComputeError::Abandoned`] so waiters never hang on a dead computation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::ComputeError;
use crate::tile::{Tile, TileKey};

type Outcome = Result<Tile, ComputeError>;

/// One-shot result cell shared by a leader and its waiters.
#[derive(Default)]
pub(crate) struct ResultSlot {
    value: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl ResultSlot {
    fn fill(&self, outcome: Outcome) {
        let mut value = self.value.lock();
        if value.is_none() {
            *value = Some(outcome);
        }
        self.ready.notify_all();
    }

    /// Block until the leader publishes, or until `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Outcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut value = self.value.lock();
        loop {
            if let Some(outcome) = value.as_ref() {
                return outcome.clone();
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut value, deadline).timed_out() {
                        return value.clone().unwrap_or(Err(ComputeError::Timeout));
                    }
                }
                None => self.ready.wait(&mut value),
            }
        }
    }
}

/// Table of tiles currently being computed through the single-flight path.
#[derive(Default)]
pub(crate) struct InFlight {
    slots: Mutex<HashMap<TileKey, Arc<ResultSlot>>>,
}

/// Outcome of [`InFlight::claim`].
pub(crate) enum Claim<'a> {
    Leader(LeaderGuard<'a>),
    Waiter(Arc<ResultSlot>),
}

impl InFlight {
    /// Register interest in `key`.
    pub(crate) fn claim(&self, key: TileKey) -> Claim<'_> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&key) {
            return Claim::Waiter(slot.clone());
        }
        let slot = Arc::new(ResultSlot::default());
        slots.insert(key, slot.clone());
        Claim::Leader(LeaderGuard {
            table: self,
            key,
            slot,
            published: false,
        })
    }

    /// Number of tiles currently in flight.
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn finish(&self, key: TileKey, slot: &ResultSlot, outcome: Outcome) {
        // Unregister first: a caller arriving after this point starts a fresh
        // computation instead of reading a finished slot.
        self.slots.lock().remove(&key);
        slot.fill(outcome);
    }
}

/// Held by the leader of an in-flight computation.
pub(crate) struct LeaderGuard<'a> {
    table: &'a InFlight,
    key: TileKey,
    slot: Arc<ResultSlot>,
    published: bool,
}

impl LeaderGuard<'_> {
    /// Publish the result to every waiter.
    pub(crate) fn publish(mut self, outcome: Outcome) {
        self.published = true;
        self.table.finish(self.key, &self.slot, outcome);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.table
                .finish(self.key, &self.slot, Err(ComputeError::Abandoned));
        }
    }
}
