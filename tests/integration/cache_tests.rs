//! Cache integration tests.
//!
//! Exercises the tile cache through the scheduler: tiles computed on worker
//! threads land in the cache, later calls are served from it, and the memory
//! bound holds under concurrent load.

use std::sync::Arc;

use parking_lot::Mutex;

use tilecore::{
    metric_comparator, CacheEvent, CacheEventKind, CacheObserver, CachingSource, ImageId,
    SchedulerConfig, TileCache, TileKey, TileScheduler,
};

use super::test_utils::{tile_for, wait_until, TestSource, TILE_BYTES};

const IMAGE: ImageId = ImageId::new(7);

fn bytes(tiles: usize) -> u64 {
    (tiles * TILE_BYTES) as u64
}

fn grid(side: i32) -> Vec<(i32, i32)> {
    (0..side).flat_map(|y| (0..side).map(move |x| (x, y))).collect()
}

fn caching_scheduler(
    cache: &Arc<TileCache>,
    source: &Arc<TestSource>,
    config: SchedulerConfig,
) -> TileScheduler {
    TileScheduler::builder(CachingSource::new(source.clone(), cache.clone()))
        .config(config)
        .cache(cache.clone())
        .build()
        .unwrap()
}

// =============================================================================
// Cache Through Scheduler
// =============================================================================

#[test]
fn test_prefetched_tiles_served_from_cache() {
    let cache = Arc::new(TileCache::with_capacity(bytes(64)));
    let source = Arc::new(TestSource::new());
    let scheduler = caching_scheduler(&cache, &source, SchedulerConfig::default());
    let indices = grid(4);

    scheduler.prefetch(IMAGE, &indices);
    wait_until("prefetch to fill the cache", || cache.tile_count() == 16);
    assert_eq!(source.total_calls(), 16);

    let tiles = scheduler.compute_blocking(IMAGE, &indices).unwrap();
    scheduler.shutdown();

    assert_eq!(source.total_calls(), 16);
    assert_eq!(tiles[5], tile_for(IMAGE, 1, 1));
    assert_eq!(cache.hit_count(), 16);
}

#[test]
fn test_memory_bound_holds_under_load() {
    let cache = Arc::new(TileCache::with_capacity(bytes(10)));
    cache.set_threshold(0.5).unwrap();
    let source = Arc::new(TestSource::new());
    let config = SchedulerConfig {
        standard_parallelism: 4,
        ..SchedulerConfig::default()
    };
    let scheduler = caching_scheduler(&cache, &source, config);

    let tiles = scheduler.compute_blocking(IMAGE, &grid(8)).unwrap();
    scheduler.shutdown();

    assert_eq!(tiles.len(), 64);
    assert!(cache.memory_usage() <= cache.capacity());
    assert!(cache.tile_count() <= 10);
    assert_eq!(cache.memory_usage(), bytes(cache.tile_count()));
}

#[test]
fn test_single_flight_populates_cache_once() {
    let cache = Arc::new(TileCache::with_capacity(bytes(8)));
    let source = Arc::new(TestSource::new());
    let scheduler = Arc::new(caching_scheduler(
        &cache,
        &source,
        SchedulerConfig::default(),
    ));

    let callers: Vec<_> = (0..6)
        .map(|_| {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || scheduler.compute_single(IMAGE, 2, 3))
        })
        .collect();
    for caller in callers {
        assert_eq!(caller.join().unwrap().unwrap(), tile_for(IMAGE, 2, 3));
    }

    assert_eq!(source.calls_for(TileKey::new(IMAGE, 2, 3)), 1);
    assert_eq!(cache.tile_count(), 1);
}

// =============================================================================
// Eviction
// =============================================================================

#[test]
fn test_metric_priority_eviction_through_source() {
    let cache = Arc::new(TileCache::with_capacity(bytes(4)));
    cache.set_priority_comparator(Some(metric_comparator()));
    let source = Arc::new(TestSource::new());

    // Synchronous pools insert in index order
    let config = SchedulerConfig {
        standard_parallelism: 0,
        prefetch_parallelism: 0,
        ..SchedulerConfig::default()
    };
    let caching = CachingSource::new(source.clone(), cache.clone())
        .with_metric(Arc::new(|_owner: ImageId, x: i32, _y: i32| x as f64));
    let scheduler = TileScheduler::builder(caching)
        .config(config)
        .cache(cache.clone())
        .build()
        .unwrap();

    let row: Vec<(i32, i32)> = (0..5).map(|x| (x, 0)).collect();
    scheduler.compute_blocking(IMAGE, &row).unwrap();

    // The fifth tile pushes usage over capacity; the two lowest metrics go
    let kept: Vec<i32> = (0..5)
        .filter(|&x| cache.contains(&TileKey::new(IMAGE, x, 0)))
        .collect();
    assert_eq!(kept, vec![2, 3, 4]);
    assert_eq!(cache.memory_usage(), bytes(3));
    assert_eq!(cache.policy_name(), "priority");
}

#[test]
fn test_recency_eviction_prefers_stale_tiles() {
    let cache = Arc::new(TileCache::with_capacity(bytes(4)));
    let owner = ImageId::new(1);
    for x in 0..4 {
        cache.put(owner, x, 0, tile_for(owner, x, 0), None);
    }

    // Touch the two oldest tiles so the middle ones become least recent
    cache.get(&TileKey::new(owner, 0, 0));
    cache.get(&TileKey::new(owner, 1, 0));
    cache.put(owner, 4, 0, tile_for(owner, 4, 0), None);

    let order: Vec<i32> = cache.recency_order().iter().map(|k| k.x).collect();
    assert_eq!(order, vec![4, 1, 0]);
}

#[test]
fn test_remove_all_isolates_images() {
    let cache = TileCache::with_capacity(bytes(16));
    let a = ImageId::new(1);
    let b = ImageId::new(2);
    for x in 0..3 {
        cache.put(a, x, 0, tile_for(a, x, 0), None);
        cache.put(b, x, 0, tile_for(b, x, 0), None);
    }

    assert_eq!(cache.remove_all(a), 3);
    assert!(cache.tiles_for(a).is_empty());
    assert_eq!(cache.tiles_for(b).len(), 3);
    assert_eq!(cache.memory_usage(), bytes(3));
}

// =============================================================================
// Diagnostics
// =============================================================================

#[derive(Default)]
struct EventCollector {
    events: Mutex<Vec<(CacheEventKind, TileKey)>>,
}

impl CacheObserver for EventCollector {
    fn on_event(&self, event: &CacheEvent) {
        self.events.lock().push((event.kind, event.entry.key));
    }
}

#[test]
fn test_observer_sees_eviction_from_worker_thread() {
    let cache = Arc::new(TileCache::with_capacity(bytes(2)));
    let collector = Arc::new(EventCollector::default());
    cache.set_observer(Some(collector.clone()));
    cache.enable_diagnostics();

    let source = Arc::new(TestSource::new());
    let config = SchedulerConfig {
        standard_parallelism: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = caching_scheduler(&cache, &source, config);
    scheduler
        .compute_blocking(IMAGE, &[(0, 0), (1, 0), (2, 0)])
        .unwrap();
    scheduler.shutdown();

    let events = collector.events.lock().clone();
    let count = |kind| events.iter().filter(|(k, _)| *k == kind).count();
    assert_eq!(count(CacheEventKind::Added), 3);
    assert!(count(CacheEventKind::RemovedByEviction) >= 1);
    assert_eq!(
        count(CacheEventKind::AboutToRemove),
        count(CacheEventKind::RemovedByEviction)
    );

    // Every eviction is announced immediately before it happens
    for pair in events.windows(2) {
        if pair[1].0 == CacheEventKind::RemovedByEviction {
            assert_eq!(pair[0], (CacheEventKind::AboutToRemove, pair[1].1));
        }
    }
}

#[test]
fn test_closure_observer() {
    let cache = TileCache::with_capacity(bytes(4));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    cache.set_observer(Some(Arc::new(move |event: &CacheEvent| {
        sink.lock().push(event.kind);
    })));
    cache.enable_diagnostics();

    cache.put(IMAGE, 0, 0, tile_for(IMAGE, 0, 0), None);
    cache.put(IMAGE, 0, 0, tile_for(IMAGE, 0, 0), None);
    cache.get(&TileKey::new(IMAGE, 0, 0));
    cache.flush();

    assert_eq!(
        *seen.lock(),
        vec![
            CacheEventKind::Added,
            CacheEventKind::UpdatedOnPut,
            CacheEventKind::UpdatedOnGet,
            CacheEventKind::RemovedByFlush,
        ]
    );
}
