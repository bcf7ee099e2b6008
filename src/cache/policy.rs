//! Eviction strategies.
//!
//! The cache always maintains its recency list; a policy decides which entry
//! to evict next. [`RecencyPolicy`] evicts the least recently used entry,
//! [`PriorityPolicy`] keeps a comparator-ordered index and evicts the lowest
//! priority entry first.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::arena::{CacheEntry, EntryArena, EntryHandle};

/// Orders cache entries by eviction priority. Entries comparing `Less` are
/// evicted first.
///
/// The comparator should only look at fields fixed at insertion (key, size,
/// metric, sequence); the last-access timestamp changes on every hit.
pub type PriorityComparator = Arc<dyn Fn(&CacheEntry, &CacheEntry) -> Ordering + Send + Sync>;

/// Chooses eviction victims for a [`TileCache`](super::TileCache).
///
/// All methods are called with the cache lock held.
pub trait EvictionPolicy: Send {
    /// Short name used in statistics and logs.
    fn name(&self) -> &'static str;

    /// An entry was inserted.
    fn on_insert(&mut self, arena: &EntryArena, handle: EntryHandle);

    /// An entry is about to be removed; it is still present in `arena`.
    fn on_remove(&mut self, arena: &EntryArena, handle: EntryHandle);

    /// An entry was accessed.
    fn on_access(&mut self, _arena: &EntryArena, _handle: EntryHandle) {}

    /// Discard all state and re-index every entry currently in `arena`.
    fn rebuild(&mut self, arena: &EntryArena);

    /// The next entry to evict, or `None` when the policy has nothing to offer.
    fn choose_victim(&self, arena: &EntryArena) -> Option<EntryHandle>;
}

// =============================================================================
// Recency
// =============================================================================

/// Least-recently-used eviction straight off the recency list.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecencyPolicy;

impl EvictionPolicy for RecencyPolicy {
    fn name(&self) -> &'static str {
        "recency"
    }

    fn on_insert(&mut self, _arena: &EntryArena, _handle: EntryHandle) {}

    fn on_remove(&mut self, _arena: &EntryArena, _handle: EntryHandle) {}

    fn rebuild(&mut self, _arena: &EntryArena) {}

    fn choose_victim(&self, arena: &EntryArena) -> Option<EntryHandle> {
        arena.tail()
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Comparator-ordered eviction.
///
/// The index is a vector of handles sorted ascending by the comparator, ties
/// broken by insertion order, so the first element is the next victim.
pub struct PriorityPolicy {
    comparator: PriorityComparator,
    index: Vec<EntryHandle>,
}

impl PriorityPolicy {
    /// Create a policy and index every entry already in `arena`.
    pub fn new(comparator: PriorityComparator, arena: &EntryArena) -> Self {
        let mut policy = Self {
            comparator,
            index: Vec::with_capacity(arena.len()),
        };
        policy.rebuild(arena);
        policy
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Indexed handles, lowest priority first.
    pub fn ordered(&self) -> &[EntryHandle] {
        &self.index
    }

    fn order(&self, a: &CacheEntry, b: &CacheEntry) -> Ordering {
        (self.comparator)(a, b).then_with(|| a.sequence().cmp(&b.sequence()))
    }

    fn search(&self, arena: &EntryArena, target: &CacheEntry) -> Result<usize, usize> {
        self.index.binary_search_by(|probe| match arena.get(*probe) {
            Some(entry) => self.order(entry, target),
            None => Ordering::Less,
        })
    }
}

impl fmt::Debug for PriorityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityPolicy")
            .field("indexed", &self.index.len())
            .finish()
    }
}

impl EvictionPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn on_insert(&mut self, arena: &EntryArena, handle: EntryHandle) {
        let Some(entry) = arena.get(handle) else {
            return;
        };
        let pos = match self.search(arena, entry) {
            Ok(pos) | Err(pos) => pos,
        };
        self.index.insert(pos, handle);
    }

    fn on_remove(&mut self, arena: &EntryArena, handle: EntryHandle) {
        let found = arena
            .get(handle)
            .and_then(|entry| self.search(arena, entry).ok())
            .filter(|&pos| self.index[pos] == handle);

        // A comparator reading mutable fields can leave the index out of
        // order; fall back to a scan.
        let pos = found.or_else(|| self.index.iter().position(|&h| h == handle));
        if let Some(pos) = pos {
            self.index.remove(pos);
        }
    }

    fn rebuild(&mut self, arena: &EntryArena) {
        self.index = arena.iter().map(|(handle, _)| handle).collect();
        let comparator = self.comparator.clone();
        self.index.sort_by(|a, b| match (arena.get(*a), arena.get(*b)) {
            (Some(ea), Some(eb)) => {
                comparator(ea, eb).then_with(|| ea.sequence().cmp(&eb.sequence()))
            }
            _ => Ordering::Equal,
        });
    }

    fn choose_victim(&self, _arena: &EntryArena) -> Option<EntryHandle> {
        self.index.first().copied()
    }
}

/// Comparator ordering entries by their metric, entries without one first.
pub fn metric_comparator() -> PriorityComparator {
    Arc::new(|a: &CacheEntry, b: &CacheEntry| match (a.metric(), b.metric()) {
        (Some(ma), Some(mb)) => ma.total_cmp(&mb),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}
