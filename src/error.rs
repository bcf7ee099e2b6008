use thiserror::Error;

use crate::tile::ImageId;

/// Errors raised when configuring the cache or the scheduler.
///
/// These are programming errors: invalid values are rejected, never clamped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Eviction threshold must be a fraction in `[0, 1]`
    #[error("Invalid memory threshold: {0} (must be between 0.0 and 1.0)")]
    InvalidThreshold(f32),

    /// A configuration value is out of range
    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: &'static str, message: String },
}

/// Errors produced while computing a single tile.
///
/// The type is `Clone` because one outcome is shared by every caller waiting
/// on the same in-flight computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The tile source ran out of memory
    #[error("Out of memory while computing tile")]
    OutOfMemory,

    /// The tile source reported a failure
    #[error("Tile computation failed: {0}")]
    Failed(String),

    /// The tile source panicked
    #[error("Tile computation panicked: {0}")]
    Panicked(String),

    /// The computing thread unwound before publishing a result
    #[error("Tile computation abandoned by its owning thread")]
    Abandoned,

    /// Waiting on another thread's computation exceeded the configured timeout
    #[error("Timed out waiting for in-flight tile computation")]
    Timeout,

    /// The scheduler shut down before the work ran
    #[error("Scheduler is shut down")]
    ShutDown,
}

impl ComputeError {
    /// Whether this is an out-of-memory condition eligible for cache-drop retry.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ComputeError::OutOfMemory)
    }
}

/// Errors surfaced by the scheduler's blocking entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// A tile computation failed; this is the first failure of the call
    #[error("Tile computation failed for ({x}, {y}) of {owner}: {source}")]
    Compute {
        owner: ImageId,
        x: i32,
        y: i32,
        #[source]
        source: ComputeError,
    },

    /// The scheduler has been shut down
    #[error("Scheduler is shut down")]
    ShutDown,
}

impl SchedulerError {
    /// The underlying computation error, if any.
    pub fn compute_error(&self) -> Option<&ComputeError> {
        match self {
            SchedulerError::Compute { source, .. } => Some(source),
            SchedulerError::ShutDown => None,
        }
    }
}
