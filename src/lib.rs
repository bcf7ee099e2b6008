//! # tilecore
//!
//! Memory-bounded tile caching and concurrent, de-duplicated tile scheduling
//! for image-processing pipelines.
//!
//! The pipeline supplies a [`TileSource`] that computes one tile of an image
//! on demand. This crate decides which computed tiles stay in memory and
//! orchestrates their computation across worker threads.
//!
//! ## Features
//!
//! - **Memory-bounded cache**: byte-accounted tile cache with threshold-based
//!   eviction by recency or by a pluggable priority comparator
//! - **Three calling conventions**: blocking fan-out, listener-driven requests
//!   and best-effort prefetch on a low-priority pool
//! - **De-duplication**: concurrent requests for one tile share one computation
//! - **Out-of-memory recovery**: drop an image's cached tiles, then the whole
//!   cache, before giving up on a tile
//!
//! ## Architecture
//!
//! - [`tile`] - Tile identity, payload and the tile source callback
//! - [`cache`] - The tile cache and its eviction policies
//! - [`scheduler`] - Worker pools, requests, jobs and listeners
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tilecore::{
//!     CachingSource, ComputeError, ImageId, SchedulerConfig, Tile, TileCache, TileScheduler,
//! };
//!
//! let cache = Arc::new(TileCache::with_capacity(16 * 1024 * 1024));
//! let render = |_image: ImageId, x: i32, y: i32| -> Result<Tile, ComputeError> {
//!     Ok(Tile::from(vec![(x + y) as u8; 256 * 256]))
//! };
//!
//! let scheduler = TileScheduler::builder(CachingSource::new(render, cache.clone()))
//!     .config(SchedulerConfig::default())
//!     .cache(cache.clone())
//!     .build()
//!     .unwrap();
//!
//! let tiles = scheduler
//!     .compute_blocking(ImageId::new(1), &[(0, 0), (1, 0), (0, 1)])
//!     .unwrap();
//! assert_eq!(tiles.len(), 3);
//! assert_eq!(cache.tile_count(), 3);
//!
//! scheduler.shutdown();
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod tile;

// Re-export commonly used types
pub use cache::{
    metric_comparator, CacheConfig, CacheEvent, CacheEventKind, CacheObserver, CacheStats,
    EvictionPolicy, PriorityComparator, TileCache,
};
pub use config::Config;
pub use error::{ComputeError, ConfigError, SchedulerError};
pub use scheduler::{
    ChannelListener, ChunkPolicy, DefaultChunkPolicy, ErrorHook, PoolKind, Request,
    RequestHandle, SchedulerConfig, TileEvent, TileListener, TileScheduler, TileStatus,
};
pub use tile::{CachingSource, ImageId, Tile, TileKey, TileSource};
