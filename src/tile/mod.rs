//! Shared tile data model.
//!
//! # Components
//!
//! - [`ImageId`]: identity of the image owning a tile
//! - [`TileKey`]: owner plus tile coordinates; the cache key and scheduler tile ID
//! - [`Tile`]: opaque, cheaply cloneable tile payload with a byte-size estimate
//! - [`TileSource`]: the external per-tile computation callback
//! - [`CachingSource`]: a source wrapper that reads through a
//!   [`TileCache`](crate::cache::TileCache)

mod key;
mod source;

pub use key::{ImageId, Tile, TileKey};
pub use source::{CachingSource, MetricFn, TileSource};
