//! Structured cache events for external monitoring.
//!
//! Diagnostics are off by default. When enabled and an observer is installed,
//! the cache records one [`CacheEvent`] per bookkeeping action and hands them
//! to the observer after releasing its lock, in the order they happened.

use serde::Serialize;

use crate::tile::{Tile, TileKey};

use super::arena::CacheEntry;

/// What happened to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheEventKind {
    /// A new entry was inserted
    Added,
    /// An entry was removed explicitly
    Removed,
    /// An entry was removed by `flush`
    RemovedByFlush,
    /// An entry was evicted under memory pressure
    RemovedByEviction,
    /// `put` found the entry already cached and refreshed it
    UpdatedOnPut,
    /// `get` hit the entry and refreshed it
    UpdatedOnGet,
    /// An entry is about to be removed; the snapshot is its last valid view
    AboutToRemove,
}

/// Copy of an entry's state at the time of an event.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: TileKey,
    pub size: u64,
    pub timestamp: u64,
    pub metric: Option<f64>,
    pub tile: Tile,
}

impl From<&CacheEntry> for EntrySnapshot {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key(),
            size: entry.size(),
            timestamp: entry.timestamp(),
            metric: entry.metric(),
            tile: entry.tile().clone(),
        }
    }
}

/// A single diagnostics event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub entry: EntrySnapshot,
}

/// Receives cache events. Must not call back into the cache synchronously
/// expecting the event's state to still hold.
pub trait CacheObserver: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

impl<F> CacheObserver for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Event buffer filled under the cache lock and drained after it is released.
#[derive(Default)]
pub(crate) struct EventLog {
    enabled: bool,
    events: Vec<CacheEvent>,
}

impl EventLog {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, kind: CacheEventKind, entry: &CacheEntry) {
        if self.enabled {
            self.events.push(CacheEvent {
                kind,
                entry: EntrySnapshot::from(entry),
            });
        }
    }

    pub(crate) fn into_events(self) -> Vec<CacheEvent> {
        self.events
    }
}
