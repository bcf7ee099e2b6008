//! Listener callbacks for non-blocking scheduling.
//!
//! Listeners are invoked on scheduler worker threads (or on the caller's
//! thread when the standard pool runs synchronously) and must not block
//! indefinitely.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::ComputeError;
use crate::tile::{ImageId, Tile, TileKey};

use super::request::RequestHandle;

/// Receives the outcome of each scheduled tile.
///
/// `requests` holds every request that referenced the tile when its outcome
/// was decided, so a listener shared by several requests can correlate them.
pub trait TileListener: Send + Sync {
    fn on_tile_computed(
        &self,
        requests: &[RequestHandle],
        owner: ImageId,
        x: i32,
        y: i32,
        tile: &Tile,
    );

    fn on_tile_failed(
        &self,
        requests: &[RequestHandle],
        owner: ImageId,
        x: i32,
        y: i32,
        error: &ComputeError,
    );

    fn on_tile_cancelled(&self, requests: &[RequestHandle], owner: ImageId, x: i32, y: i32);
}

/// Every distinct listener across `requests`, in first-seen order.
///
/// A listener attached to several requests is returned once.
pub(crate) fn distinct_listeners(requests: &[RequestHandle]) -> Vec<Arc<dyn TileListener>> {
    let mut seen: Vec<*const ()> = Vec::new();
    let mut out = Vec::new();
    for request in requests {
        for listener in request.listeners() {
            let ptr = Arc::as_ptr(listener) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
                out.push(listener.clone());
            }
        }
    }
    out
}

// =============================================================================
// Channel Listener
// =============================================================================

/// A tile outcome delivered through a [`ChannelListener`].
#[derive(Debug, Clone)]
pub enum TileEvent {
    Computed {
        key: TileKey,
        request_ids: Vec<u64>,
        tile: Tile,
    },
    Failed {
        key: TileKey,
        request_ids: Vec<u64>,
        error: ComputeError,
    },
    Cancelled {
        key: TileKey,
        request_ids: Vec<u64>,
    },
}

impl TileEvent {
    /// The tile this event is about.
    pub fn key(&self) -> TileKey {
        match self {
            TileEvent::Computed { key, .. }
            | TileEvent::Failed { key, .. }
            | TileEvent::Cancelled { key, .. } => *key,
        }
    }
}

/// Forwards tile outcomes to an unbounded tokio channel.
///
/// Lets async code await tile completion without blocking a runtime thread.
/// Events sent after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<TileEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TileEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: TileEvent) {
        let _ = self.sender.send(event);
    }
}

fn request_ids(requests: &[RequestHandle]) -> Vec<u64> {
    requests.iter().map(|r| r.id()).collect()
}

impl TileListener for ChannelListener {
    fn on_tile_computed(
        &self,
        requests: &[RequestHandle],
        owner: ImageId,
        x: i32,
        y: i32,
        tile: &Tile,
    ) {
        self.send(TileEvent::Computed {
            key: TileKey::new(owner, x, y),
            request_ids: request_ids(requests),
            tile: tile.clone(),
        });
    }

    fn on_tile_failed(
        &self,
        requests: &[RequestHandle],
        owner: ImageId,
        x: i32,
        y: i32,
        error: &ComputeError,
    ) {
        self.send(TileEvent::Failed {
            key: TileKey::new(owner, x, y),
            request_ids: request_ids(requests),
            error: error.clone(),
        });
    }

    fn on_tile_cancelled(&self, requests: &[RequestHandle], owner: ImageId, x: i32, y: i32) {
        self.send(TileEvent::Cancelled {
            key: TileKey::new(owner, x, y),
            request_ids: request_ids(requests),
        });
    }
}
