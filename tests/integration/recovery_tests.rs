//! Out-of-memory recovery tests.
//!
//! A single-tile computation that runs out of memory first drops the cached
//! tiles of its image, then the whole cache, and only reports a failure when
//! the third attempt also fails.

use std::sync::Arc;

use parking_lot::Mutex;

use tilecore::{
    ComputeError, ImageId, SchedulerConfig, SchedulerError, TileCache, TileKey, TileScheduler,
};

use super::test_utils::{tile_for, TestSource, TILE_BYTES};

const IMAGE: ImageId = ImageId::new(3);
const NEIGHBOUR: ImageId = ImageId::new(4);

type Reports = Arc<Mutex<Vec<(TileKey, ComputeError)>>>;

struct Fixture {
    scheduler: TileScheduler,
    source: Arc<TestSource>,
    cache: Arc<TileCache>,
    reports: Reports,
}

/// Scheduler over a source that runs out of memory `oom_calls` times, with a
/// cache holding two tiles of each image.
fn fixture(oom_calls: usize) -> Fixture {
    let cache = Arc::new(TileCache::with_capacity((16 * TILE_BYTES) as u64));
    for owner in [IMAGE, NEIGHBOUR] {
        for x in 10..12 {
            cache.put(owner, x, 0, tile_for(owner, x, 0), None);
        }
    }

    let source = Arc::new(TestSource::new().out_of_memory(oom_calls));
    let reports: Reports = Arc::default();
    let sink = reports.clone();

    let scheduler = TileScheduler::builder(source.clone())
        .config(SchedulerConfig::default())
        .cache(cache.clone())
        .error_hook(move |key: TileKey, error: &ComputeError| {
            sink.lock().push((key, error.clone()));
        })
        .build()
        .unwrap();

    Fixture {
        scheduler,
        source,
        cache,
        reports,
    }
}

#[test]
fn test_no_recovery_when_memory_suffices() {
    let f = fixture(0);

    let tile = f.scheduler.compute_single(IMAGE, 0, 0).unwrap();

    assert_eq!(tile, tile_for(IMAGE, 0, 0));
    assert_eq!(f.cache.tile_count(), 4);
    assert_eq!(f.source.total_calls(), 1);
}

#[test]
fn test_first_retry_drops_only_own_image() {
    let f = fixture(1);

    let tile = f.scheduler.compute_single(IMAGE, 0, 0).unwrap();

    assert_eq!(tile, tile_for(IMAGE, 0, 0));
    assert!(f.cache.tiles_for(IMAGE).is_empty());
    assert_eq!(f.cache.tiles_for(NEIGHBOUR).len(), 2);
    assert_eq!(f.source.total_calls(), 2);
    assert!(f.reports.lock().is_empty());
}

#[test]
fn test_second_retry_flushes_cache() {
    let f = fixture(2);

    let tile = f.scheduler.compute_single(IMAGE, 0, 0).unwrap();

    assert_eq!(tile, tile_for(IMAGE, 0, 0));
    assert!(f.cache.is_empty());
    assert_eq!(f.source.total_calls(), 3);
    assert!(f.reports.lock().is_empty());
}

#[test]
fn test_persistent_oom_reported_to_hook() {
    let f = fixture(3);

    let err = f.scheduler.compute_single(IMAGE, 1, 2).unwrap_err();

    assert_eq!(
        err,
        SchedulerError::Compute {
            owner: IMAGE,
            x: 1,
            y: 2,
            source: ComputeError::OutOfMemory,
        }
    );
    assert_eq!(
        err.to_string(),
        "Tile computation failed for (1, 2) of image#3: Out of memory while computing tile"
    );
    assert_eq!(f.source.total_calls(), 3);
    assert_eq!(
        *f.reports.lock(),
        vec![(TileKey::new(IMAGE, 1, 2), ComputeError::OutOfMemory)]
    );
}

#[test]
fn test_other_failure_ends_recovery() {
    let broken = TileKey::new(IMAGE, 0, 0);
    let cache = Arc::new(TileCache::with_capacity(1024));
    let source = Arc::new(TestSource::new().out_of_memory(1).failing(broken));
    let reports: Reports = Arc::default();
    let sink = reports.clone();
    let scheduler = TileScheduler::builder(source)
        .cache(cache)
        .error_hook(move |key: TileKey, error: &ComputeError| {
            sink.lock().push((key, error.clone()));
        })
        .build()
        .unwrap();

    let err = scheduler.compute_single(IMAGE, 0, 0).unwrap_err();

    // The retry failed for another reason; recovery stops there
    assert!(matches!(
        err.compute_error(),
        Some(ComputeError::Failed(_))
    ));
    assert!(reports.lock().is_empty());
}

#[test]
fn test_recovery_without_cache() {
    let source = Arc::new(TestSource::new().out_of_memory(2));
    let scheduler = TileScheduler::new(source.clone(), SchedulerConfig::default()).unwrap();

    let tile = scheduler.compute_single(NEIGHBOUR, 5, 5).unwrap();

    assert_eq!(tile, tile_for(NEIGHBOUR, 5, 5));
    assert_eq!(source.total_calls(), 3);
}
