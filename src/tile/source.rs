//! The tile computation callback and a cache-aware wrapper around it.

use std::sync::Arc;

use crate::cache::TileCache;
use crate::error::ComputeError;

use super::key::{ImageId, Tile, TileKey};

/// Synchronously produces the pixel data of one tile.
///
/// Implementations are invoked concurrently from scheduler worker threads, for
/// different tiles of the same or different images.
pub trait TileSource: Send + Sync {
    /// Compute the tile at `(x, y)` of `owner`.
    fn compute_tile(&self, owner: ImageId, x: i32, y: i32) -> Result<Tile, ComputeError>;
}

impl<F> TileSource for F
where
    F: Fn(ImageId, i32, i32) -> Result<Tile, ComputeError> + Send + Sync,
{
    fn compute_tile(&self, owner: ImageId, x: i32, y: i32) -> Result<Tile, ComputeError> {
        self(owner, x, y)
    }
}

impl<S: TileSource + ?Sized> TileSource for Arc<S> {
    fn compute_tile(&self, owner: ImageId, x: i32, y: i32) -> Result<Tile, ComputeError> {
        (**self).compute_tile(owner, x, y)
    }
}

/// Computes the eviction metric stored with a freshly computed tile.
pub type MetricFn = Arc<dyn Fn(ImageId, i32, i32) -> f64 + Send + Sync>;

/// Tile source that consults a [`TileCache`] before computing.
///
/// Computed tiles are stored in the cache, so prefetched tiles are available
/// to later lookups without recomputation.
pub struct CachingSource<S> {
    inner: S,
    cache: Arc<TileCache>,
    metric: Option<MetricFn>,
}

impl<S: TileSource> CachingSource<S> {
    /// Wrap `inner`, caching its results in `cache`.
    pub fn new(inner: S, cache: Arc<TileCache>) -> Self {
        Self {
            inner,
            cache,
            metric: None,
        }
    }

    /// Attach a metric to every tile this source caches, for priority eviction.
    pub fn with_metric(mut self, metric: MetricFn) -> Self {
        self.metric = Some(metric);
        self
    }

    /// The cache this source populates.
    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }
}

impl<S: TileSource> TileSource for CachingSource<S> {
    fn compute_tile(&self, owner: ImageId, x: i32, y: i32) -> Result<Tile, ComputeError> {
        if let Some(tile) = self.cache.get(&TileKey::new(owner, x, y)) {
            return Ok(tile);
        }

        let tile = self.inner.compute_tile(owner, x, y)?;
        let metric = self.metric.as_ref().map(|m| m(owner, x, y));
        self.cache.put(owner, x, y, tile.clone(), metric);
        Ok(tile)
    }
}
