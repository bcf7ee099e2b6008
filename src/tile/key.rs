//! Tile identity and payload types.
//!
//! A tile is addressed by the image that owns it plus its integer tile
//! coordinates. The same [`TileKey`] serves the cache (as its map key) and the
//! scheduler (to correlate requests, queued jobs and in-flight computations).

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

// =============================================================================
// Image Identity
// =============================================================================

/// Stable identifier of the image a tile belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ImageId(u64);

impl ImageId {
    /// Create an image identifier from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

impl From<u64> for ImageId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// =============================================================================
// Tile Key
// =============================================================================

/// Key for one tile of one image.
///
/// Equal inputs always produce equal keys; the key is `Copy` and cheap to hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TileKey {
    /// Owning image
    pub owner: ImageId,

    /// Tile X index
    pub x: i32,

    /// Tile Y index
    pub y: i32,
}

impl TileKey {
    /// Create a new tile key.
    pub const fn new(owner: ImageId, x: i32, y: i32) -> Self {
        Self { owner, x, y }
    }

    /// The tile coordinates as an `(x, y)` pair.
    pub const fn coords(&self) -> (i32, i32) {
        (self.x, self.y)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@({}, {})", self.owner, self.x, self.y)
    }
}

// =============================================================================
// Tile Payload
// =============================================================================

/// Computed pixel data for one tile.
///
/// The payload is opaque to this crate; only its byte size matters for memory
/// accounting. Cloning is cheap (reference counted).
#[derive(Clone, PartialEq, Eq)]
pub struct Tile {
    data: Bytes,
}

impl Tile {
    /// Wrap raw tile bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// The tile's bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size estimate used for cache memory accounting.
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("size_bytes", &self.data.len())
            .finish()
    }
}

impl From<Bytes> for Tile {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Tile {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }
}
