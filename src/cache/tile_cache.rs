//! Memory-bounded cache of computed tiles.
//!
//! # Memory Accounting
//!
//! The cache tracks the total byte size of cached tiles. When an insertion
//! pushes usage above the memory capacity, entries are evicted until usage is
//! at or below `capacity * threshold`. A tile too large to ever fit (adding
//! it would exceed the capacity and it alone exceeds `capacity * threshold`)
//! is not cached at all, since caching it would only evict it again.
//!
//! # Locking
//!
//! The entry map, recency list and eviction index share one mutex. Critical
//! sections only move handles and reference-counted payloads; observers are
//! called after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::ConfigError;
use crate::tile::{ImageId, Tile, TileKey};

use super::arena::{CacheEntry, EntryArena, EntryHandle};
use super::diagnostics::{CacheEvent, CacheEventKind, CacheObserver, EventLog};
use super::policy::{EvictionPolicy, PriorityComparator, PriorityPolicy, RecencyPolicy};

/// Default memory capacity: 64MB
pub const DEFAULT_MEMORY_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default fraction of capacity that eviction brings usage down to.
pub const DEFAULT_MEMORY_THRESHOLD: f32 = 0.75;

// =============================================================================
// Configuration
// =============================================================================

/// Cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Maximum total size of cached tiles in bytes (0 disables caching)
    pub memory_capacity: u64,

    /// Fraction of capacity retained after eviction, in `[0, 1]`
    pub memory_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

impl CacheConfig {
    /// Check that the threshold is a valid fraction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threshold(self.memory_threshold)
    }
}

fn validate_threshold(threshold: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold(threshold))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub tile_count: usize,
    pub memory_usage: u64,
    pub memory_capacity: u64,
    pub memory_threshold: f32,
    pub hit_count: u64,
    pub miss_count: u64,
    pub policy: &'static str,
}

// =============================================================================
// Cache State
// =============================================================================

struct CacheState {
    map: HashMap<TileKey, EntryHandle>,
    arena: EntryArena,
    policy: Box<dyn EvictionPolicy>,
    memory_capacity: u64,
    memory_usage: u64,
    threshold: f32,
    timestamp: u64,
    sequence: u64,
    hit_count: u64,
    miss_count: u64,
    diagnostics: bool,
    observer: Option<Arc<dyn CacheObserver>>,
}

impl CacheState {
    fn limit(&self) -> u64 {
        (self.memory_capacity as f64 * self.threshold as f64) as u64
    }

    fn next_timestamp(&mut self) -> u64 {
        let ts = self.timestamp;
        self.timestamp += 1;
        ts
    }

    fn lookup(&mut self, key: &TileKey, log: &mut EventLog) -> Option<Tile> {
        if self.memory_capacity == 0 {
            return None;
        }

        let Some(&handle) = self.map.get(key) else {
            self.miss_count += 1;
            return None;
        };

        self.touch(handle);
        self.hit_count += 1;

        let entry = self.arena.get(handle)?;
        log.record(CacheEventKind::UpdatedOnGet, entry);
        Some(entry.tile().clone())
    }

    /// Refresh timestamp and recency position. The priority index keeps its
    /// order; only the recency list moves.
    fn touch(&mut self, handle: EntryHandle) {
        let ts = self.next_timestamp();
        if let Some(entry) = self.arena.get_mut(handle) {
            entry.touch(ts);
        }
        self.arena.move_to_front(handle);
        self.policy.on_access(&self.arena, handle);
    }

    fn insert(
        &mut self,
        key: TileKey,
        tile: Tile,
        metric: Option<f64>,
        log: &mut EventLog,
    ) -> bool {
        if self.memory_capacity == 0 {
            return false;
        }

        if let Some(&handle) = self.map.get(&key) {
            self.touch(handle);
            self.hit_count += 1;
            if let Some(entry) = self.arena.get(handle) {
                log.record(CacheEventKind::UpdatedOnPut, entry);
            }
            return true;
        }

        let size = tile.size_bytes();
        if self.memory_usage.saturating_add(size) > self.memory_capacity && size > self.limit() {
            trace!(
                tile = %key,
                size,
                capacity = self.memory_capacity,
                "Tile too large to cache, skipping"
            );
            return false;
        }

        let ts = self.next_timestamp();
        let seq = self.sequence;
        self.sequence += 1;

        let handle = self
            .arena
            .push_front(CacheEntry::new(key, tile, ts, metric, seq));
        self.map.insert(key, handle);
        self.memory_usage += size;
        self.policy.on_insert(&self.arena, handle);

        if let Some(entry) = self.arena.get(handle) {
            log.record(CacheEventKind::Added, entry);
        }
        trace!(tile = %key, size, usage = self.memory_usage, "Cached tile");

        if self.memory_usage > self.memory_capacity {
            self.memory_control(log);
        }

        self.map.contains_key(&key)
    }

    fn remove_handle(
        &mut self,
        handle: EntryHandle,
        kind: CacheEventKind,
        log: &mut EventLog,
    ) -> Option<Tile> {
        let entry = self.arena.get(handle)?;
        log.record(CacheEventKind::AboutToRemove, entry);

        self.policy.on_remove(&self.arena, handle);
        let entry = self.arena.remove(handle)?;
        self.map.remove(&entry.key());
        self.memory_usage = self.memory_usage.saturating_sub(entry.size());

        log.record(kind, &entry);
        Some(entry.tile().clone())
    }

    /// Evict until usage is at or below `capacity * threshold`.
    fn memory_control(&mut self, log: &mut EventLog) {
        let limit = self.limit();
        let mut evicted = 0usize;

        while self.memory_usage > limit {
            let chosen = self.policy.choose_victim(&self.arena);
            let victim = match chosen {
                Some(handle) if self.arena.get(handle).is_some() => handle,
                _ => {
                    // The policy could not produce a live victim; the recency
                    // list is the ground truth.
                    let Some(tail) = self.arena.tail() else {
                        break;
                    };
                    warn!(
                        policy = self.policy.name(),
                        usage = self.memory_usage,
                        limit,
                        "Eviction index exhausted, falling back to recency order"
                    );
                    self.policy.rebuild(&self.arena);
                    tail
                }
            };

            if let Some(entry) = self.arena.get(victim) {
                trace!(tile = %entry.key(), size = entry.size(), "Evicting tile");
            }
            self.remove_handle(victim, CacheEventKind::RemovedByEviction, log);
            evicted += 1;
        }

        if evicted > 0 {
            debug!(
                evicted,
                usage = self.memory_usage,
                limit,
                policy = self.policy.name(),
                "Memory control pass complete"
            );
        }
    }

    fn flush(&mut self, log: &mut EventLog) {
        self.hit_count = 0;
        self.miss_count = 0;

        for handle in self.arena.handles() {
            if let Some(entry) = self.arena.get(handle) {
                log.record(CacheEventKind::RemovedByFlush, entry);
            }
        }

        self.map.clear();
        self.arena.clear();
        self.policy.rebuild(&self.arena);

        self.timestamp = 0;
        self.sequence = 0;
        self.memory_usage = 0;
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

/// Memory-bounded tile cache with recency or priority eviction.
///
/// # Thread Safety
///
/// All operations take `&self` and are serialized through one internal lock;
/// share the cache across threads with `Arc`.
///
/// # Example
///
/// ```
/// use tilecore::cache::TileCache;
/// use tilecore::tile::{ImageId, Tile, TileKey};
///
/// let cache = TileCache::with_capacity(1024 * 1024);
/// let image = ImageId::new(1);
///
/// cache.put(image, 0, 0, Tile::from(vec![0u8; 4096]), None);
/// assert!(cache.get(&TileKey::new(image, 0, 0)).is_some());
/// assert_eq!(cache.memory_usage(), 4096);
/// ```
pub struct TileCache {
    state: Mutex<CacheState>,
}

impl TileCache {
    /// Create a cache with the default capacity (64MB) and threshold (0.75).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    /// Create a cache with the given capacity in bytes.
    pub fn with_capacity(memory_capacity: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                arena: EntryArena::new(),
                policy: Box::new(RecencyPolicy),
                memory_capacity,
                memory_usage: 0,
                threshold: DEFAULT_MEMORY_THRESHOLD,
                timestamp: 0,
                sequence: 0,
                hit_count: 0,
                miss_count: 0,
                diagnostics: false,
                observer: None,
            }),
        }
    }

    /// Create a cache from a validated configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Self::with_capacity(config.memory_capacity);
        cache.state.lock().threshold = config.memory_threshold;
        Ok(cache)
    }

    /// Run `f` under the lock, then deliver any recorded events.
    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState, &mut EventLog) -> R) -> R {
        let (result, events, observer) = {
            let mut state = self.state.lock();
            let mut log = EventLog::new(state.diagnostics && state.observer.is_some());
            let result = f(&mut state, &mut log);
            (result, log.into_events(), state.observer.clone())
        };

        if !events.is_empty() {
            if let Some(observer) = observer {
                for event in &events {
                    observer.on_event(event);
                }
            }
        }

        result
    }

    /// Get a tile from the cache.
    ///
    /// A hit refreshes the entry's timestamp and moves it to the head of the
    /// recency list; a miss increments the miss counter.
    pub fn get(&self, key: &TileKey) -> Option<Tile> {
        self.with_state(|state, log| state.lookup(key, log))
    }

    /// Look up several tiles of one image in a single critical section.
    pub fn get_many(&self, owner: ImageId, indices: &[(i32, i32)]) -> Vec<Option<Tile>> {
        self.with_state(|state, log| {
            indices
                .iter()
                .map(|&(x, y)| state.lookup(&TileKey::new(owner, x, y), log))
                .collect()
        })
    }

    /// Check whether a tile is cached without touching recency or counters.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.state.lock().map.contains_key(key)
    }

    /// Store a tile.
    ///
    /// An already cached tile is treated as a hit and refreshed, not replaced.
    /// Returns `true` if the tile is cached when the call returns; `false` if
    /// it was rejected as too large, evicted straight away, or caching is
    /// disabled.
    pub fn put(&self, owner: ImageId, x: i32, y: i32, tile: Tile, metric: Option<f64>) -> bool {
        let key = TileKey::new(owner, x, y);
        self.with_state(|state, log| state.insert(key, tile, metric, log))
    }

    /// Store several tiles of one image in a single critical section.
    ///
    /// Returns the number of tiles cached.
    pub fn put_many<I>(&self, owner: ImageId, tiles: I) -> usize
    where
        I: IntoIterator<Item = (i32, i32, Tile)>,
    {
        self.with_state(|state, log| {
            tiles
                .into_iter()
                .filter(|(x, y, tile)| {
                    state.insert(TileKey::new(owner, *x, *y), tile.clone(), None, log)
                })
                .count()
        })
    }

    /// Remove a tile, returning it if it was cached.
    pub fn remove(&self, owner: ImageId, x: i32, y: i32) -> Option<Tile> {
        let key = TileKey::new(owner, x, y);
        self.with_state(|state, log| {
            let handle = *state.map.get(&key)?;
            state.remove_handle(handle, CacheEventKind::Removed, log)
        })
    }

    /// Remove every tile owned by `owner`. Returns the number removed.
    pub fn remove_all(&self, owner: ImageId) -> usize {
        let removed = self.with_state(|state, log| {
            let handles: Vec<EntryHandle> = state
                .arena
                .iter()
                .filter(|(_, entry)| entry.owner() == owner)
                .map(|(handle, _)| handle)
                .collect();

            handles
                .into_iter()
                .filter_map(|handle| state.remove_handle(handle, CacheEventKind::Removed, log))
                .count()
        });
        debug!(%owner, removed, "Removed all tiles of image");
        removed
    }

    /// All cached tiles of one image, without refreshing their recency.
    pub fn tiles_for(&self, owner: ImageId) -> Vec<(i32, i32, Tile)> {
        let state = self.state.lock();
        state
            .arena
            .iter()
            .filter(|(_, entry)| entry.owner() == owner)
            .map(|(_, entry)| (entry.key().x, entry.key().y, entry.tile().clone()))
            .collect()
    }

    /// Remove every tile and reset counters and timestamps.
    pub fn flush(&self) {
        self.with_state(|state, log| state.flush(log));
        debug!("Tile cache flushed");
    }

    /// Set the memory capacity in bytes.
    ///
    /// Shrinking below current usage evicts down to `capacity * threshold`;
    /// growing never evicts. A capacity of 0 flushes and disables the cache.
    pub fn set_capacity(&self, memory_capacity: u64) {
        self.with_state(|state, log| {
            if memory_capacity == 0 {
                state.flush(log);
            }
            state.memory_capacity = memory_capacity;
            if state.memory_usage > memory_capacity {
                state.memory_control(log);
            }
        });
        debug!(memory_capacity, "Tile cache capacity changed");
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.state.lock().memory_capacity
    }

    /// Set the eviction threshold and run eviction against it immediately.
    pub fn set_threshold(&self, threshold: f32) -> Result<(), ConfigError> {
        validate_threshold(threshold)?;
        self.with_state(|state, log| {
            state.threshold = threshold;
            state.memory_control(log);
        });
        Ok(())
    }

    /// Current eviction threshold.
    pub fn threshold(&self) -> f32 {
        self.state.lock().threshold
    }

    /// Switch between priority-ordered eviction (`Some`) and pure recency
    /// eviction (`None`).
    ///
    /// Enabling builds the priority index over every current entry.
    pub fn set_priority_comparator(&self, comparator: Option<PriorityComparator>) {
        let mut state = self.state.lock();
        state.policy = match comparator {
            Some(comparator) => Box::new(PriorityPolicy::new(comparator, &state.arena)),
            None => Box::new(RecencyPolicy),
        };
        debug!(policy = state.policy.name(), "Eviction policy changed");
    }

    /// Install a custom eviction policy, indexing current entries into it.
    pub fn set_eviction_policy(&self, mut policy: Box<dyn EvictionPolicy>) {
        let mut state = self.state.lock();
        policy.rebuild(&state.arena);
        state.policy = policy;
        debug!(policy = state.policy.name(), "Eviction policy changed");
    }

    /// Name of the active eviction policy.
    pub fn policy_name(&self) -> &'static str {
        self.state.lock().policy.name()
    }

    /// Current total size of cached tiles in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.state.lock().memory_usage
    }

    /// Number of cached tiles.
    pub fn tile_count(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().map.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.state.lock().hit_count
    }

    pub fn miss_count(&self) -> u64 {
        self.state.lock().miss_count
    }

    /// Reset hit and miss counters.
    pub fn reset_counts(&self) {
        let mut state = self.state.lock();
        state.hit_count = 0;
        state.miss_count = 0;
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            tile_count: state.map.len(),
            memory_usage: state.memory_usage,
            memory_capacity: state.memory_capacity,
            memory_threshold: state.threshold,
            hit_count: state.hit_count,
            miss_count: state.miss_count,
            policy: state.policy.name(),
        }
    }

    /// Keys from most to least recently used.
    pub fn recency_order(&self) -> Vec<TileKey> {
        let state = self.state.lock();
        state.arena.iter().map(|(_, entry)| entry.key()).collect()
    }

    /// Start recording diagnostics events for the installed observer.
    pub fn enable_diagnostics(&self) {
        self.state.lock().diagnostics = true;
    }

    /// Stop recording diagnostics events.
    pub fn disable_diagnostics(&self) {
        self.state.lock().diagnostics = false;
    }

    /// Install or remove the diagnostics observer.
    pub fn set_observer(&self, observer: Option<Arc<dyn CacheObserver>>) {
        self.state.lock().observer = observer;
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        state.arena.check_links();
        assert_eq!(state.map.len(), state.arena.len());
        let total: u64 = state.arena.iter().map(|(_, e)| e.size()).sum();
        assert_eq!(total, state.memory_usage);
        for (key, handle) in &state.map {
            assert_eq!(state.arena.get(*handle).map(|e| e.key()), Some(*key));
        }
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TileCache")
            .field("memory_capacity", &state.memory_capacity)
            .field("memory_usage", &state.memory_usage)
            .field("tiles", &state.map.len())
            .field("policy", &state.policy.name())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
