//! Configuration for the tile cache, the scheduler and the workload CLI.
//!
//! This module provides:
//! - Command-line arguments via clap
//! - Environment variables with `TILECORE_` prefix
//! - Conversion into the library's [`CacheConfig`] and [`SchedulerConfig`]
//!
//! # Environment Variables
//!
//! - `TILECORE_MEMORY_CAPACITY` - Cache capacity, e.g. `64MB` (default: 64MB)
//! - `TILECORE_MEMORY_THRESHOLD` - Fraction kept after eviction (default: 0.75)
//! - `TILECORE_PRIORITY_EVICTION` - Evict by tile metric instead of recency
//! - `TILECORE_STANDARD_THREADS` - Standard pool size (default: 2)
//! - `TILECORE_PREFETCH_THREADS` - Prefetch pool size (default: 1)
//! - `TILECORE_STANDARD_PRIORITY` - Standard pool priority 1-10 (default: 5)
//! - `TILECORE_PREFETCH_PRIORITY` - Prefetch pool priority 1-10 (default: 1)
//! - `TILECORE_SINGLE_FLIGHT_TIMEOUT_MS` - Wait limit on in-flight tiles, 0 = none

use std::time::Duration;

use clap::Parser;

use crate::cache::{CacheConfig, DEFAULT_MEMORY_THRESHOLD};
use crate::scheduler::{SchedulerConfig, MAX_PARALLELISM, MAX_PRIORITY, MIN_PRIORITY};

// =============================================================================
// Default Values
// =============================================================================

/// Default cache capacity as accepted on the command line.
pub const DEFAULT_MEMORY_CAPACITY: &str = "64MB";

/// Default number of images in the synthetic workload.
pub const DEFAULT_IMAGES: u64 = 2;

/// Default tiles per image side in the synthetic workload.
pub const DEFAULT_TILES_PER_SIDE: u32 = 16;

/// Default tile payload size in bytes.
pub const DEFAULT_TILE_BYTES: usize = 64 * 1024;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tilecore - tile cache and scheduler workload driver.
///
/// Runs a synthetic tile workload through the cache and the scheduler and
/// reports cache statistics.
#[derive(Parser, Debug, Clone)]
#[command(name = "tilecore")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Maximum memory held by cached tiles (e.g. 512KB, 64MB, 1GB; 0 disables).
    #[arg(
        long,
        default_value = DEFAULT_MEMORY_CAPACITY,
        value_parser = parse_size,
        env = "TILECORE_MEMORY_CAPACITY"
    )]
    pub memory_capacity: u64,

    /// Fraction of capacity retained after eviction (0.0-1.0).
    #[arg(long, default_value_t = DEFAULT_MEMORY_THRESHOLD, env = "TILECORE_MEMORY_THRESHOLD")]
    pub memory_threshold: f32,

    /// Evict tiles with the lowest metric first instead of the least recently used.
    #[arg(long, default_value_t = false, env = "TILECORE_PRIORITY_EVICTION")]
    pub priority_eviction: bool,

    // =========================================================================
    // Scheduler Configuration
    // =========================================================================
    /// Worker threads for blocking and listener-driven work (0 = synchronous).
    #[arg(long, default_value_t = 2, env = "TILECORE_STANDARD_THREADS")]
    pub standard_threads: usize,

    /// Worker threads for prefetch work (0 = synchronous).
    #[arg(long, default_value_t = 1, env = "TILECORE_PREFETCH_THREADS")]
    pub prefetch_threads: usize,

    /// Standard pool thread priority (1-10, clamped).
    #[arg(long, default_value_t = 5, env = "TILECORE_STANDARD_PRIORITY")]
    pub standard_priority: u8,

    /// Prefetch pool thread priority (1-10, clamped).
    #[arg(long, default_value_t = 1, env = "TILECORE_PREFETCH_PRIORITY")]
    pub prefetch_priority: u8,

    /// Maximum wait in milliseconds on another caller's in-flight tile (0 = unbounded).
    #[arg(long, default_value_t = 0, env = "TILECORE_SINGLE_FLIGHT_TIMEOUT_MS")]
    pub single_flight_timeout_ms: u64,

    // =========================================================================
    // Workload Configuration
    // =========================================================================
    /// Number of synthetic images.
    #[arg(long, default_value_t = DEFAULT_IMAGES)]
    pub images: u64,

    /// Tiles per image side; each image has side * side tiles.
    #[arg(long, default_value_t = DEFAULT_TILES_PER_SIDE)]
    pub tiles_per_side: u32,

    /// Payload size of each synthetic tile in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_BYTES)]
    pub tile_bytes: usize,

    /// Simulated compute time per tile in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub compute_ms: u64,

    /// Fail every Nth tile computation (0 = never).
    #[arg(long, default_value_t = 0)]
    pub fail_every: u64,

    // =========================================================================
    // Output Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Print final statistics as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.memory_threshold) {
            return Err(format!(
                "memory_threshold must be between 0.0 and 1.0, got {}",
                self.memory_threshold
            ));
        }

        if self.standard_threads > MAX_PARALLELISM || self.prefetch_threads > MAX_PARALLELISM {
            return Err(format!("thread counts must not exceed {}", MAX_PARALLELISM));
        }

        if self.images == 0 {
            return Err("images must be greater than 0".to_string());
        }
        if self.tiles_per_side == 0 || self.tiles_per_side > 4096 {
            return Err("tiles_per_side must be between 1 and 4096".to_string());
        }
        if self.tile_bytes == 0 {
            return Err("tile_bytes must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Cache settings.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            memory_capacity: self.memory_capacity,
            memory_threshold: self.memory_threshold,
        }
    }

    /// Scheduler settings, with priorities clamped into range.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            standard_parallelism: self.standard_threads,
            prefetch_parallelism: self.prefetch_threads,
            standard_priority: self.standard_priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            prefetch_priority: self.prefetch_priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            single_flight_timeout: (self.single_flight_timeout_ms > 0)
                .then(|| Duration::from_millis(self.single_flight_timeout_ms)),
        }
    }
}

/// Parse a byte size such as `4096`, `512KB`, `64MB` or `1GB` (binary units).
pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}': expected e.g. 4096, 512KB, 64MB", input))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", input))
}

// =============================================================================
// Tests
// =============================================================================
