//! Memory-bounded tile cache.
//!
//! # Components
//!
//! - [`TileCache`]: the cache itself, with memory accounting and eviction
//! - [`EntryArena`]: slot arena holding entries and the recency list
//! - [`EvictionPolicy`]: pluggable victim selection; [`RecencyPolicy`] (LRU)
//!   and [`PriorityPolicy`] (comparator ordered)
//! - [`CacheObserver`]: receives [`CacheEvent`]s when diagnostics are enabled

mod arena;
mod diagnostics;
mod policy;
mod tile_cache;

pub use arena::{CacheEntry, EntryArena, EntryHandle, RecencyIter};
pub use diagnostics::{CacheEvent, CacheEventKind, CacheObserver, EntrySnapshot};
pub use policy::{
    metric_comparator, EvictionPolicy, PriorityComparator, PriorityPolicy, RecencyPolicy,
};
pub use tile_cache::{
    CacheConfig, CacheStats, TileCache, DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_THRESHOLD,
};
