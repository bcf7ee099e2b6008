//! Slot arena holding cache entries and the recency list threaded through them.
//!
//! Entries live in a `Vec` of slots addressed by stable [`EntryHandle`]s.
//! The doubly linked recency list stores `prev`/`next` as handles, giving O(1)
//! unlink and move-to-front without shared mutable references. Freed slots are
//! recycled through a free list; each slot carries a generation that is bumped
//! on removal, so a handle to a removed entry never resolves to its successor.

use crate::tile::{ImageId, Tile, TileKey};

/// Stable index of an entry inside the [`EntryArena`].
///
/// A handle only resolves while the entry it was issued for is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    entry: Option<CacheEntry>,
}

/// One cached tile plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: TileKey,
    tile: Tile,
    size: u64,
    timestamp: u64,
    metric: Option<f64>,
    sequence: u64,
    prev: Option<EntryHandle>,
    next: Option<EntryHandle>,
}

impl CacheEntry {
    pub(crate) fn new(
        key: TileKey,
        tile: Tile,
        timestamp: u64,
        metric: Option<f64>,
        sequence: u64,
    ) -> Self {
        Self {
            key,
            size: tile.size_bytes(),
            tile,
            timestamp,
            metric,
            sequence,
            prev: None,
            next: None,
        }
    }

    /// The entry's key.
    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Owning image.
    pub fn owner(&self) -> ImageId {
        self.key.owner
    }

    /// The cached tile.
    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    /// Payload size in bytes, fixed at insertion.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last-access timestamp (monotonic per cache).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Externally supplied priority/cost metric.
    pub fn metric(&self) -> Option<f64> {
        self.metric
    }

    /// Insertion order; breaks ties between equal priorities.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn touch(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }
}

/// Arena of cache entries with an intrusive recency list.
///
/// The head is the most recently used entry, the tail the least recently used.
#[derive(Debug, Default)]
pub struct EntryArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<EntryHandle>,
    tail: Option<EntryHandle>,
    len: usize,
}

impl EntryArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up a live entry.
    pub fn get(&self, handle: EntryHandle) -> Option<&CacheEntry> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut CacheEntry> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Most recently used entry.
    pub fn head(&self) -> Option<EntryHandle> {
        self.head
    }

    /// Least recently used entry.
    pub fn tail(&self) -> Option<EntryHandle> {
        self.tail
    }

    /// Iterate entries from most to least recently used.
    pub fn iter(&self) -> RecencyIter<'_> {
        RecencyIter {
            arena: self,
            cursor: self.head,
        }
    }

    /// Insert an entry at the head of the recency list.
    pub(crate) fn push_front(&mut self, mut entry: CacheEntry) -> EntryHandle {
        entry.prev = None;
        entry.next = self.head;

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = Some(entry);
                EntryHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                EntryHandle {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };

        match self.head {
            Some(old_head) => {
                if let Some(old) = self.get_mut(old_head) {
                    old.prev = Some(handle);
                }
            }
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
        self.len += 1;
        handle
    }

    /// Remove an entry, returning it. Unknown or stale handles return `None`.
    pub(crate) fn remove(&mut self, handle: EntryHandle) -> Option<CacheEntry> {
        if self.get(handle).is_none() {
            return None;
        }
        self.unlink(handle);
        let slot = &mut self.slots[handle.index];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        entry
    }

    /// Move an entry to the head of the recency list.
    pub(crate) fn move_to_front(&mut self, handle: EntryHandle) {
        if self.head == Some(handle) || self.get(handle).is_none() {
            return;
        }
        self.unlink(handle);

        let old_head = self.head;
        if let Some(entry) = self.get_mut(handle) {
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(old) = self.get_mut(h) {
                    old.prev = Some(handle);
                }
            }
            None => self.tail = Some(handle),
        }
        self.head = Some(handle);
    }

    /// Drop every entry and reset the list.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len()).rev().collect();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Handles of all live entries, most recently used first.
    pub(crate) fn handles(&self) -> Vec<EntryHandle> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(h) = cursor {
            out.push(h);
            cursor = self.get(h).and_then(|e| e.next);
        }
        out
    }

    fn unlink(&mut self, handle: EntryHandle) {
        let (prev, next) = match self.get(handle) {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(e) = self.get_mut(p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.get_mut(n) {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(entry) = self.get_mut(handle) {
            entry.prev = None;
            entry.next = None;
        }
    }

    /// Verify that head/tail and every prev/next link are mutually consistent
    /// and that the list visits exactly the live entries.
    #[cfg(test)]
    pub(crate) fn check_links(&self) {
        let mut count = 0;
        let mut prev: Option<EntryHandle> = None;
        let mut cursor = self.head;
        while let Some(h) = cursor {
            let entry = self.get(h).expect("list references a dead slot");
            assert_eq!(entry.prev, prev, "broken prev link");
            prev = Some(h);
            cursor = entry.next;
            count += 1;
            assert!(count <= self.len, "cycle in recency list");
        }
        assert_eq!(self.tail, prev, "tail does not match last list element");
        assert_eq!(count, self.len, "list length differs from live entries");
        let live = self.slots.iter().filter(|s| s.entry.is_some()).count();
        assert_eq!(live, self.len);
    }
}

/// Iterator over entries from most to least recently used.
pub struct RecencyIter<'a> {
    arena: &'a EntryArena,
    cursor: Option<EntryHandle>,
}

impl<'a> Iterator for RecencyIter<'a> {
    type Item = (EntryHandle, &'a CacheEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        let entry = self.arena.get(handle)?;
        self.cursor = entry.next;
        Some((handle, entry))
    }
}
