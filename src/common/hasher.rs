//! Cached Keccak-256 hashing of fixed-size inputs.
//!
//! Addresses and slot keys are hashed on every trie navigation; the cache
//! amortizes the Keccak work for hot keys, and misses borrow a hasher
//! instance from a pool instead of building one per call.

use parking_lot::Mutex;
use sha3::{Digest, Keccak256};

use super::{Address, Hash, Key, LruCache, MemoryFootprint};

/// A fixed-width input of the cached hasher.
pub trait FixedInput: Copy + Eq + std::hash::Hash {
    fn bytes(&self) -> &[u8];
}

impl FixedInput for Address {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FixedInput for Key {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A pool of reusable Keccak-256 instances.
///
/// The pool grows with demand and retains idle hashers for reuse; it never
/// blocks a caller beyond the brief pop/push on its free list.
pub struct HasherPool {
    pool: Mutex<Vec<Keccak256>>,
}

impl HasherPool {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Checks a hasher out of the pool, creating one if none is idle.
    pub fn get(&self) -> Keccak256 {
        self.pool.lock().pop().unwrap_or_default()
    }

    /// Returns a hasher to the pool for later reuse.
    ///
    /// The hasher must be in its reset state (`finalize_reset` leaves it
    /// there).
    pub fn put(&self, hasher: Keccak256) {
        self.pool.lock().push(hasher);
    }

    /// Number of idle hashers currently retained.
    pub fn idle(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let pool = self.pool.lock();
        MemoryFootprint::new(
            std::mem::size_of::<Self>() + pool.capacity() * std::mem::size_of::<Keccak256>(),
        )
    }
}

impl Default for HasherPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An LRU-cached Keccak-256 hasher for fixed-size inputs.
pub struct CachedHasher<K: FixedInput> {
    cache: Mutex<LruCache<K, Hash>>,
    pool: HasherPool,
}

impl<K: FixedInput> CachedHasher<K> {
    /// Creates a hasher caching up to `capacity` digests.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            pool: HasherPool::new(),
        }
    }

    /// Returns the Keccak-256 digest of the input, from cache if possible.
    pub fn hash(&self, input: K) -> Hash {
        if let Some(digest) = self.cache.lock().get(&input) {
            return *digest;
        }
        let mut hasher = self.pool.get();
        hasher.update(input.bytes());
        let digest = Hash(hasher.finalize_reset().into());
        self.pool.put(hasher);
        self.cache.lock().set(input, digest);
        digest
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let mut footprint = MemoryFootprint::new(std::mem::size_of::<Self>());
        footprint.add_child("cache", self.cache.lock().memory_footprint());
        footprint.add_child("hashers_pool", self.pool.memory_footprint());
        footprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keccak(data: &[u8]) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    #[test]
    fn test_hash_pass_through() {
        let cache_size = 100;
        let hasher = CachedHasher::new(cache_size);
        let mut addr = Address::ZERO;
        for i in 0..2 * cache_size {
            assert_eq!(hasher.hash(addr), keccak(addr.bytes()));
            addr.0[i % 20] = addr.0[i % 20].wrapping_add(1);
        }
    }

    #[test]
    fn test_cached_result_is_stable() {
        let hasher = CachedHasher::new(16);
        let key = Key([7u8; 32]);
        let first = hasher.hash(key);
        let second = hasher.hash(key);
        assert_eq!(first, second);
        assert_eq!(first, keccak(key.bytes()));
    }

    #[test]
    fn test_pool_check_in_out() {
        let pool = HasherPool::new();
        let hasher = pool.get();
        assert_eq!(pool.idle(), 0);

        pool.put(hasher);
        assert_eq!(pool.idle(), 1);

        let _hasher = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_concurrent_hashing() {
        use std::sync::Arc;

        let hasher = Arc::new(CachedHasher::new(64));
        let mut handles = Vec::new();
        for worker in 0..8u8 {
            let hasher = Arc::clone(&hasher);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u8 {
                    let mut addr = Address::ZERO;
                    addr.0[0] = worker;
                    addr.0[1] = i;
                    assert_eq!(hasher.hash(addr), keccak(addr.bytes()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_memory_footprint_children() {
        let hasher = CachedHasher::<Address>::new(128);
        let footprint = hasher.memory_footprint();
        assert!(footprint.child("cache").is_some());
        assert!(footprint.child("hashers_pool").is_some());
        assert!(footprint.total() > 0);
    }
}
