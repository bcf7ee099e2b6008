//! Concurrent, de-duplicated tile computation.
//!
//! # Components
//!
//! - [`TileScheduler`]: blocking, listener-driven and prefetch entry points
//!   over a standard and a prefetch worker pool
//! - [`Request`]: handle for one listener-driven call, with per-tile status
//! - [`TileListener`]: outcome callbacks; [`ChannelListener`] bridges them to
//!   a tokio channel
//! - [`ChunkPolicy`]: how bulk requests are split into chunk jobs
//!
//! # De-duplication
//!
//! Listener-driven requests for a tile that is already queued join the queued
//! job instead of queueing another. [`TileScheduler::compute_single`] shares
//! one in-flight computation among concurrent callers for the same tile.

mod chunk;
mod job;
mod listener;
mod pool;
mod request;
mod single_flight;
mod tile_scheduler;

pub use chunk::{ChunkPolicy, DefaultChunkPolicy};
pub use listener::{ChannelListener, TileEvent, TileListener};
pub use pool::{clamp_priority, PoolKind, MAX_PRIORITY, MIN_PRIORITY, NORM_PRIORITY};
pub use request::{Request, RequestHandle, TileStatus};
pub use tile_scheduler::{
    ErrorHook, LogErrorHook, SchedulerConfig, TileScheduler, TileSchedulerBuilder,
    MAX_PARALLELISM,
};
