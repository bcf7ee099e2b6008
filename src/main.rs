//! tilecore - drives a synthetic tile workload through the cache and scheduler.
//!
//! Each image is prefetched, then its first row is requested through
//! listeners, a quadrant is computed in blocking mode and the center tile is
//! requested concurrently through the single-flight path.

use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilecore::{
    cache::{metric_comparator, CacheStats, TileCache},
    config::Config,
    error::ComputeError,
    scheduler::{ChannelListener, TileEvent, TileListener, TileScheduler},
    tile::{CachingSource, ImageId, Tile, TileSource},
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Synthetic Source
// =============================================================================

/// Produces tiles filled with a coordinate-derived byte.
struct SyntheticSource {
    tile_bytes: usize,
    compute_time: Duration,
    fail_every: u64,
    computed: AtomicU64,
}

impl TileSource for SyntheticSource {
    fn compute_tile(&self, owner: ImageId, x: i32, y: i32) -> Result<Tile, ComputeError> {
        if !self.compute_time.is_zero() {
            std::thread::sleep(self.compute_time);
        }

        let n = self.computed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(ComputeError::Failed(format!(
                "injected failure at tile ({}, {}) of {}",
                x, y, owner
            )));
        }

        let fill = (owner.get() as i64 * 31 + x as i64 * 7 + y as i64) as u8;
        Ok(Tile::from(vec![fill; self.tile_bytes]))
    }
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Debug, Default, Serialize)]
struct Report {
    images: u64,
    tiles_per_image: usize,
    computed: u64,
    listener_computed: usize,
    listener_failed: usize,
    blocking_failures: usize,
    single_flight_failures: usize,
    elapsed_ms: u128,
    cache: Option<CacheStats>,
}

async fn run(config: Config) -> Result<(), String> {
    let started = Instant::now();

    let cache = TileCache::from_config(&config.cache_config()).map_err(|e| e.to_string())?;
    let cache = Arc::new(cache);
    if config.priority_eviction {
        cache.set_priority_comparator(Some(metric_comparator()));
    }

    let source = Arc::new(SyntheticSource {
        tile_bytes: config.tile_bytes,
        compute_time: Duration::from_millis(config.compute_ms),
        fail_every: config.fail_every,
        computed: AtomicU64::new(0),
    });

    // Tiles near the image center are kept longest under priority eviction
    let side = config.tiles_per_side as i32;
    let center = side / 2;
    let caching = CachingSource::new(source.clone(), cache.clone()).with_metric(Arc::new(
        move |_owner: ImageId, x: i32, y: i32| -(((x - center).abs() + (y - center).abs()) as f64),
    ));

    let scheduler = Arc::new(
        TileScheduler::builder(caching)
            .config(config.scheduler_config())
            .cache(cache.clone())
            .build()
            .map_err(|e| e.to_string())?,
    );

    info!(
        "Running workload: {} image(s), {}x{} tiles of {} bytes",
        config.images, side, side, config.tile_bytes
    );

    let all: Vec<(i32, i32)> = (0..side)
        .flat_map(|y| (0..side).map(move |x| (x, y)))
        .collect();
    let first_row: Vec<(i32, i32)> = (0..side).map(|x| (x, 0)).collect();
    let quadrant: Vec<(i32, i32)> = (0..center.max(1))
        .flat_map(|y| (0..center.max(1)).map(move |x| (x, y)))
        .collect();

    let mut report = Report {
        images: config.images,
        tiles_per_image: all.len(),
        ..Report::default()
    };

    for raw in 0..config.images {
        let image = ImageId::new(raw);

        scheduler.prefetch(image, &all);

        let (listener, mut events) = ChannelListener::channel();
        let listener: Arc<dyn TileListener> = Arc::new(listener);
        let request = scheduler.schedule(image, &first_row, vec![listener]);

        let blocking = {
            let scheduler = scheduler.clone();
            let quadrant = quadrant.clone();
            tokio::task::spawn_blocking(move || scheduler.compute_blocking(image, &quadrant))
        };

        let singles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::task::spawn_blocking(move || scheduler.compute_single(image, center, center))
            })
            .collect();

        let mut outstanding = request.tile_indices().len();
        while outstanding > 0 {
            match events.recv().await {
                Some(TileEvent::Computed { .. }) => report.listener_computed += 1,
                Some(TileEvent::Failed { key, error, .. }) => {
                    warn!("Tile {} failed: {}", key, error);
                    report.listener_failed += 1;
                }
                Some(TileEvent::Cancelled { .. }) => {}
                None => break,
            }
            outstanding -= 1;
        }

        match blocking.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("Blocking computation for {} failed: {}", image, e);
                report.blocking_failures += 1;
            }
            Err(e) => return Err(format!("blocking task panicked: {}", e)),
        }

        for single in singles {
            match single.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Single-flight computation for {} failed: {}", image, e);
                    report.single_flight_failures += 1;
                }
                Err(e) => return Err(format!("single-flight task panicked: {}", e)),
            }
        }

        info!("  {} done, cache holds {} tiles", image, cache.tile_count());
    }

    let scheduler = Arc::try_unwrap(scheduler).map_err(|_| "scheduler still in use".to_string())?;
    tokio::task::spawn_blocking(move || scheduler.shutdown())
        .await
        .map_err(|e| format!("shutdown task panicked: {}", e))?;

    report.computed = source.computed.load(Ordering::Relaxed);
    report.elapsed_ms = started.elapsed().as_millis();
    report.cache = Some(cache.stats());

    print_report(&report, config.json)
}

fn print_report(report: &Report, json: bool) -> Result<(), String> {
    if json {
        let out = serde_json::to_string_pretty(report).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    info!("");
    info!("Workload finished in {} ms", report.elapsed_ms);
    info!("  Tiles computed:      {}", report.computed);
    info!(
        "  Listener outcomes:   {} computed, {} failed",
        report.listener_computed, report.listener_failed
    );
    info!("  Blocking failures:   {}", report.blocking_failures);
    info!("  Single-flight fails: {}", report.single_flight_failures);
    if let Some(stats) = &report.cache {
        info!(
            "  Cache: {} tiles, {:.2} MB of {:.2} MB ({} policy)",
            stats.tile_count,
            stats.memory_usage as f64 / (1024.0 * 1024.0),
            stats.memory_capacity as f64 / (1024.0 * 1024.0),
            stats.policy
        );
        info!("  Cache hits/misses:   {}/{}", stats.hit_count, stats.miss_count);
    }
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tilecore=debug"
    } else {
        "tilecore=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
