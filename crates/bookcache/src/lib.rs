//! # bookcache
//!
//! Thread-safe, memory-bounded key/value cache with LRU eviction.
//!
//! ## Architecture
//! - **Book**: slab of entries addressed by stable 32-bit bookmarks, with the
//!   free list threaded through unused pages
//! - **Hash index**: open-addressed table of (hash, bookmark) pairs using
//!   double hashing and tombstone deletion; grows by doubling
//! - **Evictor**: LRU list over bookmarks, behind a small trait so other
//!   policies can be plugged in
//! - **Cache**: one reader/writer lock over index and book; readers record
//!   recency through the evictor's own mutex
//!
//! ## Memory accounting
//! Only key + value bytes count against the budget. A `set` larger than the
//! whole budget is rejected; otherwise least recently used entries are
//! evicted until usage fits again.
//!
//! ```
//! use bookcache::{Cache, SetOutcome};
//!
//! let cache = Cache::new(1024).unwrap();
//! assert_eq!(cache.set(b"ab", b"1234"), SetOutcome::Inserted);
//! assert_eq!(cache.get(b"ab").as_deref(), Some(&b"1234"[..]));
//! assert_eq!(cache.space_used(), 6);
//! ```

#![warn(missing_docs)]

mod book;
mod cache;
mod error;
mod eviction;
mod index;
mod stats;

pub use book::{Bookmark, NO_BOOKMARK};
pub use cache::{Cache, CacheConfig, DeleteOutcome, SetOutcome, ValueRef};
pub use error::{Error, Result};
pub use eviction::{Evictor, Lru};
pub use index::{
    AHasher, KeyHasher, MultiplicativeHasher, DEFAULT_TABLE_CAPACITY, MIN_TABLE_CAPACITY,
};
pub use stats::{CacheStats, StatsSnapshot};
