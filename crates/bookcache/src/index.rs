//! Open-addressed hash index mapping keys to bookmarks
//!
//! Two parallel arrays of power-of-two length: `hashes` holds the encoded key
//! hash of each slot (or one of the `EMPTY`/`DELETED` sentinels) and
//! `bookmarks` holds the page of the entry living in that slot.
//!
//! Collisions are resolved by double hashing: the probe starts at
//! `hash & mask` and advances by an odd step derived from the hash, so every
//! sequence visits all slots before repeating. Deletion leaves a tombstone.
//! Live + tombstoned slots are kept below half the capacity; crossing that
//! line rebuilds the table.

use std::hash::BuildHasher;

use ahash::RandomState;

use crate::book::{Book, Bookmark, NO_BOOKMARK};
use crate::error::{Error, Result};

/// Slot never used
pub(crate) const EMPTY: u32 = 0;

/// Slot whose entry was deleted
pub(crate) const DELETED: u32 = 1;

const HIGH_BIT: u32 = 1 << 31;

/// Knuth's multiplicative constant (2^32 / golden ratio)
const HASH_MULTIPLIER: u32 = 2_654_435_769;

/// Second multiplicative pass for the probe step
const STEP_MULTIPLIER: u32 = 0x85eb_ca6b;

/// Table capacity used by [`CacheConfig::new`](crate::CacheConfig::new)
pub const DEFAULT_TABLE_CAPACITY: usize = 1 << 7;

/// Smallest accepted table capacity
pub const MIN_TABLE_CAPACITY: usize = 4;

/// Raw 32-bit hash of key bytes
///
/// Implementations only need to be deterministic for the lifetime of one
/// cache; sentinel values are remapped by the index.
pub trait KeyHasher: Send + Sync {
    /// Hash `key`
    fn hash_key(&self, key: &[u8]) -> u32;
}

/// Knuth multiplicative hash folded over every key byte
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplicativeHasher;

impl KeyHasher for MultiplicativeHasher {
    #[inline]
    fn hash_key(&self, key: &[u8]) -> u32 {
        key.iter().fold(0u32, |hash, &byte| {
            hash.wrapping_mul(HASH_MULTIPLIER).wrapping_add(byte as u32)
        })
    }
}

/// AHash-backed hasher with per-instance random seeds
#[derive(Clone, Default)]
pub struct AHasher {
    state: RandomState,
}

impl AHasher {
    /// Create a hasher with random seeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hasher with fixed seeds (reproducible layouts)
    pub fn with_seeds(k0: u64, k1: u64, k2: u64, k3: u64) -> Self {
        Self {
            state: RandomState::with_seeds(k0, k1, k2, k3),
        }
    }
}

impl KeyHasher for AHasher {
    #[inline]
    fn hash_key(&self, key: &[u8]) -> u32 {
        let hash = BuildHasher::hash_one(&self.state, key);
        (hash ^ (hash >> 32)) as u32
    }
}

/// Remap a raw hash so it never collides with a sentinel
///
/// Deterministic in `(raw, key_len)`, so identical keys always encode alike.
#[inline]
pub(crate) fn encode(raw: u32, key_len: usize) -> u32 {
    if raw == EMPTY || raw == DELETED {
        raw ^ (key_len as u32 | HIGH_BIT)
    } else {
        raw
    }
}

/// Probe step for `hash`; always odd, hence coprime with the capacity
#[inline]
fn probe_step(hash: u32) -> usize {
    (hash.wrapping_mul(STEP_MULTIPLIER).rotate_left(16) | 1) as usize
}

/// Result of walking a probe sequence for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Key lives in this slot
    Found(usize),
    /// Key is absent; this is the first reusable slot on its sequence
    Vacant(usize),
}

#[derive(Debug)]
pub(crate) struct HashIndex {
    hashes: Vec<u32>,
    bookmarks: Vec<Bookmark>,
    live: usize,
    dead: usize,
}

impl HashIndex {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= MIN_TABLE_CAPACITY,
            "table capacity {} must be a power of two >= {}",
            capacity,
            MIN_TABLE_CAPACITY
        );
        Self {
            hashes: vec![EMPTY; capacity],
            bookmarks: vec![NO_BOOKMARK; capacity],
            live: 0,
            dead: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.hashes.len()
    }

    /// Live entries
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn tombstones(&self) -> usize {
        self.dead
    }

    /// Entries the book must be able to hold at this capacity
    pub(crate) fn entry_capacity(&self) -> usize {
        self.capacity() / 2
    }

    pub(crate) fn bookmark(&self, slot: usize) -> Bookmark {
        debug_assert!(self.hashes[slot] > DELETED, "slot {} is not live", slot);
        self.bookmarks[slot]
    }

    pub(crate) fn is_empty_slot(&self, slot: usize) -> bool {
        self.hashes[slot] == EMPTY
    }

    #[inline]
    fn mask(&self) -> usize {
        self.hashes.len() - 1
    }

    /// Slot holding `key`, if present
    pub(crate) fn find(&self, book: &Book, key: &[u8], hash: u32) -> Option<usize> {
        let mask = self.mask();
        let step = probe_step(hash) & mask;
        let mut slot = hash as usize & mask;
        for _ in 0..self.capacity() {
            match self.hashes[slot] {
                EMPTY => return None,
                stored if stored == hash => {
                    if book.read(self.bookmarks[slot]).key() == key {
                        return Some(slot);
                    }
                }
                _ => {}
            }
            slot = (slot + step) & mask;
        }
        panic!(
            "probe sequence exhausted: {} live + {} tombstones in {} slots",
            self.live,
            self.dead,
            self.capacity()
        );
    }

    /// Walk the probe sequence for an insert-or-update
    ///
    /// Tombstones are remembered but skipped, since the key may still live
    /// further along the sequence.
    pub(crate) fn probe(&self, book: &Book, key: &[u8], hash: u32) -> Probe {
        let mask = self.mask();
        let step = probe_step(hash) & mask;
        let mut slot = hash as usize & mask;
        let mut reusable = None;
        for _ in 0..self.capacity() {
            match self.hashes[slot] {
                EMPTY => return Probe::Vacant(reusable.unwrap_or(slot)),
                DELETED => {
                    if reusable.is_none() {
                        reusable = Some(slot);
                    }
                }
                stored if stored == hash => {
                    if book.read(self.bookmarks[slot]).key() == key {
                        return Probe::Found(slot);
                    }
                }
                _ => {}
            }
            slot = (slot + step) & mask;
        }
        match reusable {
            Some(slot) => Probe::Vacant(slot),
            None => panic!(
                "probe sequence exhausted: {} live + {} tombstones in {} slots",
                self.live,
                self.dead,
                self.capacity()
            ),
        }
    }

    /// First never-used slot on the sequence for `hash`
    pub(crate) fn vacant_slot(&self, hash: u32) -> usize {
        let mask = self.mask();
        let step = probe_step(hash) & mask;
        let mut slot = hash as usize & mask;
        for _ in 0..self.capacity() {
            if self.hashes[slot] == EMPTY {
                return slot;
            }
            slot = (slot + step) & mask;
        }
        panic!("no empty slot in a table of {}", self.capacity());
    }

    /// Filling one more never-used slot would reach half the capacity
    pub(crate) fn needs_rebuild(&self) -> bool {
        self.live + self.dead + 1 >= self.entry_capacity()
    }

    pub(crate) fn occupy(&mut self, slot: usize, hash: u32, bookmark: Bookmark) {
        debug_assert!(hash > DELETED, "sentinel hash {} stored", hash);
        match self.hashes[slot] {
            EMPTY => {}
            DELETED => self.dead -= 1,
            stored => panic!("slot {} already holds hash {:#x}", slot, stored),
        }
        self.hashes[slot] = hash;
        self.bookmarks[slot] = bookmark;
        self.live += 1;
    }

    /// Tombstone `slot`, returning the bookmark that lived there
    pub(crate) fn vacate(&mut self, slot: usize) -> Bookmark {
        assert!(
            self.hashes[slot] > DELETED,
            "vacating slot {} which holds no entry",
            slot
        );
        self.hashes[slot] = DELETED;
        self.live -= 1;
        self.dead += 1;
        std::mem::replace(&mut self.bookmarks[slot], NO_BOOKMARK)
    }

    /// Reinsert every live entry into fresh arrays, dropping tombstones
    ///
    /// Capacity doubles unless tombstones are at least as numerous as live
    /// entries, in which case it stays put. The book is grown to match and
    /// every moved entry gets its new `position`.
    pub(crate) fn rebuild(&mut self, book: &mut Book) {
        let capacity = if self.dead >= self.live {
            self.capacity()
        } else {
            self.capacity() * 2
        };
        let old_hashes = std::mem::replace(&mut self.hashes, vec![EMPTY; capacity]);
        let old_bookmarks = std::mem::replace(&mut self.bookmarks, vec![NO_BOOKMARK; capacity]);
        book.grow(capacity / 2);
        self.dead = 0;

        for (hash, bookmark) in old_hashes.into_iter().zip(old_bookmarks) {
            if hash == EMPTY || hash == DELETED {
                continue;
            }
            let slot = self.vacant_slot(hash);
            self.hashes[slot] = hash;
            self.bookmarks[slot] = bookmark;
            book.read_mut(bookmark).position = slot;
        }
    }

    /// Forget every slot; capacity is kept
    pub(crate) fn clear(&mut self) {
        self.hashes.fill(EMPTY);
        self.bookmarks.fill(NO_BOOKMARK);
        self.live = 0;
        self.dead = 0;
    }

    pub(crate) fn check_invariants(&self, book: &Book) -> Result<()> {
        let mut live = 0;
        let mut dead = 0;
        for (slot, &hash) in self.hashes.iter().enumerate() {
            match hash {
                EMPTY => {}
                DELETED => dead += 1,
                _ => {
                    live += 1;
                    let entry = book.read(self.bookmarks[slot]);
                    if entry.position != slot {
                        return Err(Error::Invariant(format!(
                            "entry in slot {} records position {}",
                            slot, entry.position
                        )));
                    }
                    if self.find(book, entry.key(), hash) != Some(slot) {
                        return Err(Error::Invariant(format!(
                            "entry in slot {} is unreachable by probing",
                            slot
                        )));
                    }
                }
            }
        }
        if live != self.live || dead != self.dead {
            return Err(Error::Invariant(format!(
                "counted {} live / {} tombstones, recorded {} / {}",
                live, dead, self.live, self.dead
            )));
        }
        if self.live + self.dead >= self.entry_capacity() {
            return Err(Error::Invariant(format!(
                "load {} + {} reached half of {}",
                self.live,
                self.dead,
                self.capacity()
            )));
        }
        if book.len() != self.live {
            return Err(Error::Invariant(format!(
                "book holds {} entries, index {}",
                book.len(),
                self.live
            )));
        }
        Ok(())
    }
}
