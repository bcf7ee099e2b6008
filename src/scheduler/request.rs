//! Handles for listener-driven scheduling calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::tile::{ImageId, TileKey};

use super::listener::TileListener;
use super::tile_scheduler::Shared;

/// Shared handle to a [`Request`].
pub type RequestHandle = Arc<Request>;

/// Lifecycle of one tile within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TileStatus {
    Pending,
    Processing,
    Computed,
    Failed,
    Cancelled,
}

impl TileStatus {
    /// Whether the tile has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TileStatus::Computed | TileStatus::Failed | TileStatus::Cancelled
        )
    }
}

/// One non-blocking scheduling call.
///
/// Tracks per-tile status and the listeners to notify. Several requests may
/// wait on the same tile; each outcome is reported to the listeners of every
/// request that still references it.
pub struct Request {
    id: u64,
    owner: ImageId,
    indices: Vec<(i32, i32)>,
    listeners: Vec<Arc<dyn TileListener>>,
    statuses: Mutex<HashMap<(i32, i32), TileStatus>>,
    scheduler: Weak<Shared>,
}

impl Request {
    pub(crate) fn new(
        id: u64,
        owner: ImageId,
        indices: Vec<(i32, i32)>,
        listeners: Vec<Arc<dyn TileListener>>,
        scheduler: Weak<Shared>,
    ) -> Self {
        let statuses = indices
            .iter()
            .map(|&index| (index, TileStatus::Pending))
            .collect();
        Self {
            id,
            owner,
            indices,
            listeners,
            statuses: Mutex::new(statuses),
            scheduler,
        }
    }

    /// Identifier unique within the scheduler that created the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The image whose tiles were requested.
    pub fn image(&self) -> ImageId {
        self.owner
    }

    /// Requested tile indices, in request order, without duplicates.
    pub fn tile_indices(&self) -> &[(i32, i32)] {
        &self.indices
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn TileListener>] {
        &self.listeners
    }

    /// Whether `(x, y)` is part of this request.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.statuses.lock().contains_key(&(x, y))
    }

    /// Status of one tile, or `None` if it was not requested.
    pub fn status(&self, x: i32, y: i32) -> Option<TileStatus> {
        self.statuses.lock().get(&(x, y)).copied()
    }

    /// Whether every requested tile has reached a final state.
    pub fn is_finished(&self) -> bool {
        self.statuses.lock().values().all(|s| s.is_terminal())
    }

    pub(crate) fn set_status(&self, x: i32, y: i32, status: TileStatus) {
        if let Some(slot) = self.statuses.lock().get_mut(&(x, y)) {
            *slot = status;
        }
    }

    pub(crate) fn key(&self, x: i32, y: i32) -> TileKey {
        TileKey::new(self.owner, x, y)
    }

    /// Cancel tiles of this request that have not started computing.
    ///
    /// An empty slice cancels the whole request. Has no effect once the
    /// scheduler is gone.
    pub fn cancel_tiles(self: &Arc<Self>, indices: &[(i32, i32)]) {
        if let Some(shared) = self.scheduler.upgrade() {
            shared.cancel(self, indices);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("tiles", &self.indices.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
