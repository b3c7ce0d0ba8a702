//! BookCache: memory-bounded cache composing the book, index and evictor

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use crate::book::{Book, Entry};
use crate::error::{Error, Result};
use crate::eviction::{Evictor, Lru};
use crate::index::{
    encode, HashIndex, KeyHasher, MultiplicativeHasher, Probe, DEFAULT_TABLE_CAPACITY,
    MIN_TABLE_CAPACITY,
};
use crate::stats::CacheStats;

/// Borrowed view of a cached value
///
/// Holds the cache's shared lock: writers on any thread wait until it is
/// dropped, so do not keep it across a `set` or `delete` on the same thread.
pub type ValueRef<'a> = MappedRwLockReadGuard<'a, [u8]>;

/// Result of [`Cache::set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was not present and has been stored
    Inserted,
    /// The key was present and its value replaced
    Updated,
    /// Key + value exceed the whole memory budget; nothing changed
    Rejected,
}

impl SetOutcome {
    /// Check if the value is now in the cache
    pub fn is_stored(self) -> bool {
        !matches!(self, SetOutcome::Rejected)
    }
}

/// Result of [`Cache::delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The key was present and has been removed
    Deleted,
    /// The key was not present
    NotFound,
}

/// Construction parameters for a [`Cache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Budget for the sum of key + value bytes of all live entries
    pub max_memory: usize,
    /// Hash table slots allocated up front (power of two)
    pub initial_table_capacity: usize,
}

impl CacheConfig {
    /// Config with the default initial table capacity
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            initial_table_capacity: DEFAULT_TABLE_CAPACITY,
        }
    }

    /// Override the initial table capacity
    pub fn with_initial_table_capacity(mut self, capacity: usize) -> Self {
        self.initial_table_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_memory == 0 {
            return Err(Error::ZeroMemory);
        }
        let capacity = self.initial_table_capacity;
        if !capacity.is_power_of_two() || capacity < MIN_TABLE_CAPACITY {
            return Err(Error::InvalidTableCapacity(capacity));
        }
        Ok(())
    }
}

/// Index, book and usage; mutated only under the cache's write lock
///
/// The evictor has its own mutex so readers can record touches while holding
/// the shared lock. Lock order is always store before evictor.
struct Store<E> {
    index: HashIndex,
    book: Book,
    evictor: Mutex<E>,
    mem_total: usize,
}

impl<E: Evictor> Store<E> {
    /// Drop the entry in `slot` from index, book and usage
    ///
    /// The evictor must already have forgotten the entry.
    fn detach(&mut self, slot: usize) -> Entry {
        let bookmark = self.index.vacate(slot);
        let entry = self.book.free(bookmark);
        self.mem_total -= entry.size();
        entry
    }

    fn remove(&mut self, slot: usize) -> Entry {
        let bookmark = self.index.bookmark(slot);
        self.evictor.get_mut().on_remove(bookmark);
        self.detach(slot)
    }

    /// Evict until usage fits `budget`, returning how many entries went
    fn evict_to(&mut self, budget: usize) -> u64 {
        let mut evicted = 0;
        while self.mem_total > budget {
            let victim = match self.evictor.get_mut().evict() {
                Some(bookmark) => bookmark,
                None => panic!(
                    "{} bytes in use over budget {} with nothing to evict",
                    self.mem_total, budget
                ),
            };
            let slot = self.book.read(victim).position;
            self.detach(slot);
            evicted += 1;
        }
        evicted
    }
}

/// Thread-safe, memory-bounded key/value cache with LRU eviction
///
/// `create` is [`Cache::new`]; `destroy` is dropping the cache.
pub struct Cache<H = MultiplicativeHasher, E = Lru> {
    hasher: H,
    mem_capacity: usize,
    store: RwLock<Store<E>>,
    stats: CacheStats,
}

impl Cache {
    /// Create a cache holding at most `max_memory` bytes of keys and values
    ///
    /// # Arguments
    /// * `max_memory` - Memory budget in bytes
    ///
    /// # Returns
    /// * `Result<Cache>` - Empty cache, or `Error::ZeroMemory`
    pub fn new(max_memory: usize) -> Result<Self> {
        Self::with_config(CacheConfig::new(max_memory), MultiplicativeHasher)
    }
}

impl<H: KeyHasher> Cache<H> {
    /// Create a cache with a custom key hasher
    pub fn with_hasher(max_memory: usize, hasher: H) -> Result<Self> {
        Self::with_config(CacheConfig::new(max_memory), hasher)
    }
}

impl<H: KeyHasher, E: Evictor + Default> Cache<H, E> {
    /// Create a cache from a full config
    ///
    /// # Arguments
    /// * `config` - Memory budget and initial table capacity
    /// * `hasher` - Key hasher used for the lifetime of the cache
    ///
    /// # Returns
    /// * `Result<Cache>` - Empty cache, or a config error
    pub fn with_config(config: CacheConfig, hasher: H) -> Result<Self> {
        config.validate()?;
        let index = HashIndex::new(config.initial_table_capacity);
        let book = Book::new(index.entry_capacity());

        Ok(Self {
            hasher,
            mem_capacity: config.max_memory,
            store: RwLock::new(Store {
                index,
                book,
                evictor: Mutex::new(E::default()),
                mem_total: 0,
            }),
            stats: CacheStats::new(),
        })
    }
}

impl<H: KeyHasher, E: Evictor> Cache<H, E> {
    #[inline]
    fn hash(&self, key: &[u8]) -> u32 {
        encode(self.hasher.hash_key(key), key.len())
    }

    /// Insert or overwrite `key`, evicting least recently used entries to
    /// stay within budget
    ///
    /// # Arguments
    /// * `key` - Key bytes (copied)
    /// * `value` - Value bytes (copied)
    ///
    /// # Returns
    /// * `SetOutcome` - `Rejected` if key + value alone exceed the budget
    pub fn set(&self, key: &[u8], value: &[u8]) -> SetOutcome {
        let size = key.len() + value.len();
        if size > self.mem_capacity {
            self.stats.record_rejection();
            return SetOutcome::Rejected;
        }
        let hash = self.hash(key);

        let mut guard = self.store.write();
        let store = &mut *guard;
        let outcome = match store.index.probe(&store.book, key, hash) {
            Probe::Found(slot) => {
                let bookmark = store.index.bookmark(slot);
                let entry = store.book.read_mut(bookmark);
                store.mem_total -= entry.value().len();
                store.mem_total += value.len();
                entry.replace_value(value);
                store.evictor.get_mut().on_touch(bookmark);
                SetOutcome::Updated
            }
            Probe::Vacant(mut slot) => {
                if store.index.is_empty_slot(slot) && store.index.needs_rebuild() {
                    store.index.rebuild(&mut store.book);
                    slot = store.index.vacant_slot(hash);
                    self.stats.record_rebuild();
                }
                let bookmark = store.book.allocate(Entry::new(slot, key, value));
                store.index.occupy(slot, hash, bookmark);
                store.evictor.get_mut().on_insert(bookmark);
                store.mem_total += size;
                SetOutcome::Inserted
            }
        };

        for _ in 0..store.evict_to(self.mem_capacity) {
            self.stats.record_eviction();
        }
        match outcome {
            SetOutcome::Inserted => self.stats.record_insert(),
            _ => self.stats.record_update(),
        }
        outcome
    }

    /// Look up `key` and mark it most recently used
    ///
    /// # Arguments
    /// * `key` - Key bytes
    ///
    /// # Returns
    /// * `Option<ValueRef>` - View of the stored value, valid while held
    pub fn get(&self, key: &[u8]) -> Option<ValueRef<'_>> {
        let hash = self.hash(key);
        let store = self.store.read();
        let Some(slot) = store.index.find(&store.book, key, hash) else {
            self.stats.record_miss();
            return None;
        };
        let bookmark = store.index.bookmark(slot);
        store.evictor.lock().on_touch(bookmark);
        self.stats.record_hit();

        Some(RwLockReadGuard::map(store, move |store| {
            store.book.read(bookmark).value()
        }))
    }

    /// Check whether `key` is cached without touching its recency
    pub fn contains(&self, key: &[u8]) -> bool {
        let hash = self.hash(key);
        let store = self.store.read();
        store.index.find(&store.book, key, hash).is_some()
    }

    /// Remove `key` if present
    ///
    /// # Arguments
    /// * `key` - Key bytes
    ///
    /// # Returns
    /// * `DeleteOutcome` - `NotFound` if the key was absent
    pub fn delete(&self, key: &[u8]) -> DeleteOutcome {
        let hash = self.hash(key);
        let mut store = self.store.write();
        match store.index.find(&store.book, key, hash) {
            Some(slot) => {
                store.remove(slot);
                self.stats.record_delete();
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NotFound,
        }
    }

    /// Sum of key + value bytes over all live entries
    pub fn space_used(&self) -> usize {
        self.store.read().mem_total
    }

    /// Get the memory budget
    pub fn capacity(&self) -> usize {
        self.mem_capacity
    }

    /// Get the number of live entries
    pub fn len(&self) -> usize {
        self.store.read().index.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the current hash table capacity (slots)
    pub fn table_capacity(&self) -> usize {
        self.store.read().index.capacity()
    }

    /// Get the number of tombstoned hash table slots
    pub fn tombstones(&self) -> usize {
        self.store.read().index.tombstones()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop every entry; table capacity and statistics are kept
    pub fn clear(&self) {
        let mut guard = self.store.write();
        let store = &mut *guard;
        store.book.clear();
        store.index.clear();
        store.evictor.get_mut().clear();
        store.mem_total = 0;
    }

    /// Validate every cross-structure invariant
    ///
    /// Walks the whole table, book and evictor; meant for tests and debugging.
    pub fn check_invariants(&self) -> Result<()> {
        let store = self.store.read();
        store.book.check_invariants()?;
        store.index.check_invariants(&store.book)?;
        if store.book.capacity() != store.index.entry_capacity() {
            return Err(Error::Invariant(format!(
                "book holds {} pages for a table of {} slots",
                store.book.capacity(),
                store.index.capacity()
            )));
        }

        let evictor = store.evictor.lock();
        evictor.check_invariants()?;
        if evictor.len() != store.index.len() {
            return Err(Error::Invariant(format!(
                "evictor tracks {} entries, index holds {}",
                evictor.len(),
                store.index.len()
            )));
        }

        let mut total = 0;
        for (bookmark, entry) in store.book.iter() {
            total += entry.size();
            if !evictor.contains(bookmark) {
                return Err(Error::Invariant(format!(
                    "live bookmark {} is not tracked by the evictor",
                    bookmark
                )));
            }
            let hash = self.hash(entry.key());
            if store.index.find(&store.book, entry.key(), hash) != Some(entry.position) {
                return Err(Error::Invariant(format!(
                    "bookmark {} is not found at its position {}",
                    bookmark, entry.position
                )));
            }
        }
        if total != store.mem_total {
            return Err(Error::Invariant(format!(
                "entries hold {} bytes, usage records {}",
                total, store.mem_total
            )));
        }
        if store.mem_total > self.mem_capacity {
            return Err(Error::Invariant(format!(
                "usage {} exceeds budget {}",
                store.mem_total, self.mem_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AHasher;

    fn value_of(cache: &Cache, key: &[u8]) -> Option<Vec<u8>> {
        cache.get(key).map(|v| v.to_vec())
    }

    #[test]
    fn test_cache_basic() {
        let cache = Cache::new(1024).unwrap();

        assert_eq!(cache.set(b"key", b"value"), SetOutcome::Inserted);
        assert_eq!(cache.get(b"key").as_deref(), Some(&b"value"[..]));
        assert_eq!(cache.space_used(), 8);
        assert_eq!(cache.len(), 1);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_cache_miss() {
        let cache = Cache::new(1024).unwrap();
        assert!(cache.get(b"missing").is_none());
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_cache_update() {
        let cache = Cache::new(1024).unwrap();

        cache.set(b"key", b"short");
        assert_eq!(cache.set(b"key", b"a longer value"), SetOutcome::Updated);
        assert_eq!(value_of(&cache, b"key"), Some(b"a longer value".to_vec()));
        assert_eq!(cache.space_used(), 3 + 14);

        assert_eq!(cache.set(b"key", b"v"), SetOutcome::Updated);
        assert_eq!(value_of(&cache, b"key"), Some(b"v".to_vec()));
        assert_eq!(cache.space_used(), 4);
        assert_eq!(cache.len(), 1);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_cache_delete() {
        let cache = Cache::new(1024).unwrap();

        cache.set(b"a", b"1");
        cache.set(b"b", b"2");
        assert_eq!(cache.delete(b"a"), DeleteOutcome::Deleted);

        assert!(cache.get(b"a").is_none());
        assert_eq!(value_of(&cache, b"b"), Some(b"2".to_vec()));
        assert_eq!(cache.space_used(), 2);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_delete_twice() {
        let cache = Cache::new(1024).unwrap();

        cache.set(b"a", b"1");
        assert_eq!(cache.delete(b"a"), DeleteOutcome::Deleted);
        let used = cache.space_used();
        assert_eq!(cache.delete(b"a"), DeleteOutcome::NotFound);
        assert_eq!(cache.space_used(), used);
        assert_eq!(cache.delete(b"never"), DeleteOutcome::NotFound);
    }

    #[test]
    fn test_set_after_delete() {
        let cache = Cache::new(1024).unwrap();

        cache.set(b"a", b"1");
        cache.delete(b"a");
        assert_eq!(cache.set(b"a", b"2"), SetOutcome::Inserted);
        assert_eq!(value_of(&cache, b"a"), Some(b"2".to_vec()));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_reject_oversized() {
        let cache = Cache::new(10).unwrap();

        cache.set(b"a", b"1");
        assert_eq!(cache.set(b"k", b"0123456789"), SetOutcome::Rejected);
        assert_eq!(cache.space_used(), 2);
        assert_eq!(value_of(&cache, b"a"), Some(b"1".to_vec()));
        assert!(cache.get(b"k").is_none());

        // Oversized update leaves the old value in place
        assert_eq!(cache.set(b"a", b"0123456789"), SetOutcome::Rejected);
        assert_eq!(value_of(&cache, b"a"), Some(b"1".to_vec()));
        assert_eq!(cache.stats().rejections(), 2);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_exact_budget_fits() {
        let cache = Cache::new(4).unwrap();

        assert_eq!(cache.set(b"ab", b"cd"), SetOutcome::Inserted);
        assert_eq!(cache.space_used(), 4);

        cache.set(b"x", b"y");
        assert!(cache.get(b"ab").is_none());
        assert_eq!(cache.space_used(), 2);
    }

    #[test]
    fn test_eviction_order() {
        let cache = Cache::new(6).unwrap();

        cache.set(b"A", b"1");
        cache.set(b"B", b"2");
        cache.set(b"C", b"3");
        assert_eq!(cache.space_used(), 6);

        cache.get(b"A");
        cache.set(b"D", b"4");

        assert!(!cache.contains(b"B"));
        assert!(cache.contains(b"A"));
        assert!(cache.contains(b"C"));
        assert!(cache.contains(b"D"));
        assert_eq!(cache.space_used(), 6);
        assert_eq!(cache.stats().evictions(), 1);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_update_refreshes_recency() {
        let cache = Cache::new(6).unwrap();

        cache.set(b"A", b"1");
        cache.set(b"B", b"2");
        cache.set(b"C", b"3");
        cache.set(b"A", b"9");
        cache.set(b"D", b"4");

        assert!(!cache.contains(b"B"));
        assert_eq!(value_of(&cache, b"A"), Some(b"9".to_vec()));
    }

    #[test]
    fn test_contains_does_not_touch() {
        let cache = Cache::new(4).unwrap();

        cache.set(b"A", b"1");
        cache.set(b"B", b"2");
        assert!(cache.contains(b"A"));
        cache.set(b"C", b"3");

        assert!(!cache.contains(b"A"));
        assert!(cache.contains(b"B"));
    }

    #[test]
    fn test_growing_update_evicts_others() {
        let cache = Cache::new(10).unwrap();

        cache.set(b"a", b"1");
        cache.set(b"b", b"1");
        assert_eq!(cache.set(b"a", b"12345678"), SetOutcome::Updated);

        assert_eq!(cache.space_used(), 9);
        assert!(cache.get(b"b").is_none());
        assert_eq!(value_of(&cache, b"a"), Some(b"12345678".to_vec()));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_eviction_scenario_32_bytes() {
        let cache = Cache::new(32).unwrap();

        assert_eq!(cache.set(b"ab", b"1234"), SetOutcome::Inserted);
        assert_eq!(cache.space_used(), 6);

        let long = b"12345678901234567890123456";
        assert_eq!(cache.set(b"cd", long), SetOutcome::Inserted);

        assert!(cache.space_used() <= 32);
        assert!(cache.get(b"ab").is_none());
        assert_eq!(value_of(&cache, b"cd"), Some(long.to_vec()));
        assert_eq!(cache.space_used(), 28);
    }

    #[test]
    fn test_growth_round_trip() {
        let cache = Cache::new(1 << 20).unwrap();
        let initial = cache.table_capacity();

        for i in 0..1000u32 {
            let key = format!("key-{}", i);
            assert_eq!(cache.set(key.as_bytes(), &i.to_le_bytes()), SetOutcome::Inserted);
        }

        assert!(cache.table_capacity() > initial);
        assert!(cache.table_capacity() >= 2048);
        assert!(cache.stats().rebuilds() >= 1);
        assert_eq!(cache.len(), 1000);
        for i in 0..1000u32 {
            let key = format!("key-{}", i);
            assert_eq!(value_of(&cache, key.as_bytes()), Some(i.to_le_bytes().to_vec()));
        }
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_growth_after_deletes() {
        let cache = Cache::new(1 << 20).unwrap();

        for i in 0..300u32 {
            cache.set(format!("k{}", i).as_bytes(), b"v");
        }
        for i in (0..300u32).step_by(3) {
            cache.delete(format!("k{}", i).as_bytes());
        }
        for i in 300..600u32 {
            cache.set(format!("k{}", i).as_bytes(), b"v");
        }

        for i in 0..600u32 {
            let key = format!("k{}", i);
            let expected = i >= 300 || i % 3 != 0;
            assert_eq!(cache.contains(key.as_bytes()), expected, "key {}", key);
        }
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_tombstone_churn_stays_bounded() {
        let cache = Cache::new(1 << 20).unwrap();

        for _ in 0..50 {
            for i in 0..40u32 {
                cache.set(format!("churn-{}", i).as_bytes(), b"value");
            }
            for i in 0..40u32 {
                cache.delete(format!("churn-{}", i).as_bytes());
            }
        }

        assert!(cache.table_capacity() <= 256);
        assert!(cache.is_empty());
        assert_eq!(cache.space_used(), 0);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_sentinel_hash_keys() {
        // Raw multiplicative hashes of "" and [1] are the EMPTY and DELETED sentinels
        let cache = Cache::new(1024).unwrap();

        cache.set(b"", b"empty key");
        cache.set(&[1], b"one");
        assert_eq!(value_of(&cache, b""), Some(b"empty key".to_vec()));
        assert_eq!(value_of(&cache, &[1]), Some(b"one".to_vec()));
        assert_eq!(cache.delete(b""), DeleteOutcome::Deleted);
        assert_eq!(value_of(&cache, &[1]), Some(b"one".to_vec()));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_space_used_matches_entries() {
        let cache = Cache::new(100).unwrap();
        let mut i = 0u32;
        while i < 200 {
            let key = format!("k{}", i % 37);
            let value = vec![b'x'; (i % 11) as usize];
            cache.set(key.as_bytes(), &value);
            if i % 5 == 0 {
                cache.delete(format!("k{}", (i * 7) % 37).as_bytes());
            }
            assert!(cache.space_used() <= 100);
            i += 1;
        }
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_clear() {
        let cache = Cache::new(1024).unwrap();

        cache.set(b"a", b"1");
        cache.set(b"b", b"2");
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.space_used(), 0);
        assert!(cache.get(b"a").is_none());
        cache.set(b"c", b"3");
        assert_eq!(value_of(&cache, b"c"), Some(b"3".to_vec()));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_stats() {
        let cache = Cache::new(4).unwrap();

        cache.set(b"a", b"1");
        cache.set(b"a", b"2");
        cache.get(b"a");
        cache.get(b"z");
        cache.set(b"b", b"1");
        cache.set(b"c", b"1");
        cache.delete(b"c");

        let stats = cache.stats();
        assert_eq!(stats.inserts(), 3);
        assert_eq!(stats.updates(), 1);
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.evictions(), 1);
        assert_eq!(stats.deletes(), 1);
    }

    #[test]
    fn test_ahasher_cache() {
        let cache = Cache::with_hasher(1 << 16, AHasher::new()).unwrap();

        for i in 0..500u32 {
            cache.set(&i.to_be_bytes(), b"v");
        }
        for i in 0..500u32 {
            assert!(cache.contains(&i.to_be_bytes()));
        }
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(Cache::new(0), Err(Error::ZeroMemory)));

        let config = CacheConfig::new(64).with_initial_table_capacity(100);
        assert!(matches!(
            Cache::<MultiplicativeHasher, Lru>::with_config(config, MultiplicativeHasher),
            Err(Error::InvalidTableCapacity(100))
        ));

        let config = CacheConfig::new(64).with_initial_table_capacity(2);
        assert!(Cache::<MultiplicativeHasher, Lru>::with_config(config, MultiplicativeHasher)
            .is_err());

        let config = CacheConfig::new(64).with_initial_table_capacity(4);
        let cache: Cache = Cache::with_config(config, MultiplicativeHasher).unwrap();
        assert_eq!(cache.table_capacity(), 4);
        cache.set(b"a", b"1");
        cache.set(b"b", b"1");
        assert_eq!(cache.table_capacity(), 8);
        cache.check_invariants().unwrap();
    }
}
