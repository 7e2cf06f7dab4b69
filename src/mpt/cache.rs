//! Node cache with dirty write-back.
//!
//! Each node variant has its own LRU of resolved nodes in front of its
//! stock. Cached nodes are shared behind `Arc<RwLock<..>>`; the owned
//! read/write guards double as the node handles the forest works with,
//! releasing on drop.
//!
//! Eviction skips pinned entries (a handle is outstanding) and writes dirty
//! victims back to the stock. `flush` persists every dirty node without
//! evicting anything.

use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

use crate::common::MemoryFootprint;
use crate::store::{Record, Result as StoreResult, Stock, StoreError, StoreMetrics};

use super::node::{AccountNode, BranchNode, ExtensionNode, Node, ValueNode};

/// A cached node together with its persistence state.
pub struct NodeEntry {
    pub node: Node,
    /// Set when the in-memory node differs from its stock record.
    pub dirty: bool,
}

/// Shared ownership of a cached node.
pub type NodeHandle = Arc<RwLock<NodeEntry>>;

/// Owned read access to a node; released on drop.
pub type NodeReadGuard = ArcRwLockReadGuard<RawRwLock, NodeEntry>;

/// Owned write access to a node; released on drop.
pub type NodeWriteGuard = ArcRwLockWriteGuard<RawRwLock, NodeEntry>;

/// Bridges a node variant record to the unified [`Node`] enum.
pub trait NodeVariant: Record {
    fn wrap(self) -> Node;
    fn peel(node: &Node) -> Option<&Self>;
}

impl NodeVariant for BranchNode {
    fn wrap(self) -> Node {
        Node::Branch(self)
    }
    fn peel(node: &Node) -> Option<&Self> {
        match node {
            Node::Branch(n) => Some(n),
            _ => None,
        }
    }
}

impl NodeVariant for ExtensionNode {
    fn wrap(self) -> Node {
        Node::Extension(self)
    }
    fn peel(node: &Node) -> Option<&Self> {
        match node {
            Node::Extension(n) => Some(n),
            _ => None,
        }
    }
}

impl NodeVariant for AccountNode {
    fn wrap(self) -> Node {
        Node::Account(self)
    }
    fn peel(node: &Node) -> Option<&Self> {
        match node {
            Node::Account(n) => Some(n),
            _ => None,
        }
    }
}

impl NodeVariant for ValueNode {
    fn wrap(self) -> Node {
        Node::Value(self)
    }
    fn peel(node: &Node) -> Option<&Self> {
        match node {
            Node::Value(n) => Some(n),
            _ => None,
        }
    }
}

/// An LRU of resolved nodes of one variant over its stock.
pub struct NodeCache<R: NodeVariant> {
    cache: Mutex<crate::common::LruCache<u64, NodeHandle>>,
    stock: Mutex<Stock<R>>,
    metrics: Arc<StoreMetrics>,
    /// In immutable mode every node loaded from disk is treated as frozen.
    freeze_loaded: bool,
}

impl<R: NodeVariant> NodeCache<R> {
    pub fn new(
        stock: Stock<R>,
        capacity: usize,
        freeze_loaded: bool,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            cache: Mutex::new(crate::common::LruCache::new(capacity)),
            stock: Mutex::new(stock),
            metrics,
            freeze_loaded,
        }
    }

    /// Resolves the node stored under `index`, loading it on a miss.
    pub fn get(&self, index: u64) -> StoreResult<NodeHandle> {
        if let Some(handle) = self.cache.lock().get(&index) {
            self.metrics.inc_node_hits();
            return Ok(Arc::clone(handle));
        }
        self.metrics.inc_node_misses();

        // Load outside the cache lock; a racing load of the same index is
        // resolved below in favor of the first inserted handle.
        let record = self.stock.lock().get(index)?;
        let mut node = record.wrap();
        if self.freeze_loaded {
            node.set_frozen();
        }
        let handle = Arc::new(RwLock::new(NodeEntry { node, dirty: false }));

        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&index) {
            return Ok(Arc::clone(existing));
        }
        let handle_out = Arc::clone(&handle);
        let evicted = cache.set(index, handle);
        self.handle_eviction(&mut cache, evicted)?;
        Ok(handle_out)
    }

    /// Allocates a fresh node in the stock and caches it.
    pub fn add(&self, record: R) -> StoreResult<(u64, NodeHandle)> {
        let index = self.stock.lock().add(&record)?;
        let handle = Arc::new(RwLock::new(NodeEntry {
            node: record.wrap(),
            dirty: false,
        }));
        let handle_out = Arc::clone(&handle);
        let mut cache = self.cache.lock();
        let evicted = cache.set(index, handle);
        self.handle_eviction(&mut cache, evicted)?;
        Ok((index, handle_out))
    }

    /// Drops the node from the cache and returns its id to the stock's free
    /// list.
    pub fn release(&self, index: u64) {
        self.cache.lock().remove(&index);
        self.stock.lock().release(index);
    }

    /// Writes every dirty node back to the stock and flushes it.
    pub fn flush(&self) -> StoreResult<()> {
        let cache = self.cache.lock();
        let mut stock = self.stock.lock();
        for (&index, handle) in cache.iter() {
            let mut entry = handle.write();
            if entry.dirty {
                let record = R::peel(&entry.node).ok_or_else(variant_mismatch)?;
                stock.set(index, record)?;
                entry.dirty = false;
                self.metrics.inc_node_write_backs();
            }
        }
        stock.flush()
    }

    /// Flushes and closes the underlying stock.
    pub fn close(&self) -> StoreResult<()> {
        self.flush()?;
        self.stock.lock().close()
    }

    /// Number of live ids in the underlying stock.
    pub fn stored_nodes(&self) -> u64 {
        self.stock.lock().len()
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let cache = self.cache.lock();
        let mut footprint = MemoryFootprint::new(
            std::mem::size_of::<Self>()
                + cache.len() * (std::mem::size_of::<NodeEntry>() + std::mem::size_of::<R>()),
        );
        footprint.add_child("index", cache.memory_footprint());
        footprint.add_child("stock", self.stock.lock().memory_footprint());
        footprint
    }

    /// Processes an eviction victim: pinned entries are put back and the
    /// next victim is tried; dirty victims are written back to the stock.
    fn handle_eviction(
        &self,
        cache: &mut crate::common::LruCache<u64, NodeHandle>,
        mut evicted: Option<(u64, NodeHandle)>,
    ) -> StoreResult<()> {
        let mut attempts = cache.len() + 1;
        while let Some((index, handle)) = evicted {
            if Arc::strong_count(&handle) > 1 {
                // A handle is outstanding; the entry must stay resident.
                cache.reinsert_mru(index, handle);
                attempts -= 1;
                if attempts == 0 {
                    // Everything is pinned; tolerate exceeding the capacity.
                    return Ok(());
                }
                evicted = cache.pop_lru();
                continue;
            }
            self.metrics.inc_node_evictions();
            let entry = handle.read();
            if entry.dirty {
                let record = R::peel(&entry.node).ok_or_else(variant_mismatch)?;
                if let Err(err) = self.stock.lock().set(index, record) {
                    drop(entry);
                    cache.reinsert_mru(index, handle);
                    return Err(err);
                }
                self.metrics.inc_node_write_backs();
            }
            return Ok(());
        }
        Ok(())
    }
}

fn variant_mismatch() -> StoreError {
    StoreError::Corruption("node variant does not match its cache".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Key, Value};

    fn value_cache(capacity: usize) -> NodeCache<ValueNode> {
        let metrics = Arc::new(StoreMetrics::new());
        let stock = Stock::open_memory(16, Arc::clone(&metrics));
        NodeCache::new(stock, capacity, false, metrics)
    }

    fn value_node(byte: u8) -> ValueNode {
        ValueNode::new(Key([byte; 32]), Value([byte; 32]))
    }

    #[test]
    fn test_add_and_get() {
        let cache = value_cache(4);
        let (index, _handle) = cache.add(value_node(1)).unwrap();
        let handle = cache.get(index).unwrap();
        let guard = handle.read();
        match &guard.node {
            Node::Value(v) => assert_eq!(v.value, Value([1; 32])),
            other => panic!("unexpected node {:?}", other.kind()),
        }
    }

    #[test]
    fn test_eviction_writes_dirty_node_back() {
        let cache = value_cache(2);
        let (index, handle) = cache.add(value_node(1)).unwrap();
        {
            let mut entry = handle.write();
            if let Node::Value(v) = &mut entry.node {
                v.value = Value([9; 32]);
            }
            entry.dirty = true;
        }
        drop(handle);

        // Overflow the cache so node 1 is evicted and written back.
        for byte in 2..5u8 {
            cache.add(value_node(byte)).unwrap();
        }

        let reloaded = cache.get(index).unwrap();
        let guard = reloaded.read();
        match &guard.node {
            Node::Value(v) => assert_eq!(v.value, Value([9; 32])),
            other => panic!("unexpected node {:?}", other.kind()),
        }
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let cache = value_cache(2);
        let (index, handle) = cache.add(value_node(1)).unwrap();
        for byte in 2..6u8 {
            cache.add(value_node(byte)).unwrap();
        }
        // The pinned handle still resolves to the same entry.
        let again = cache.get(index).unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
    }

    #[test]
    fn test_flush_persists_dirty_nodes() {
        let cache = value_cache(8);
        let (index, handle) = cache.add(value_node(1)).unwrap();
        {
            let mut entry = handle.write();
            if let Node::Value(v) = &mut entry.node {
                v.value = Value([7; 32]);
            }
            entry.dirty = true;
        }
        drop(handle);
        cache.flush().unwrap();

        // After a flush the stock record carries the new value.
        let record = cache.stock.lock().get(index).unwrap();
        assert_eq!(record.value, Value([7; 32]));
    }

    #[test]
    fn test_release_recycles_id() {
        let cache = value_cache(4);
        let (index, handle) = cache.add(value_node(1)).unwrap();
        drop(handle);
        cache.release(index);
        let (reused, _) = cache.add(value_node(2)).unwrap();
        assert_eq!(reused, index);
    }

    #[test]
    fn test_loaded_nodes_can_be_marked_frozen() {
        let metrics = Arc::new(StoreMetrics::new());
        let stock = Stock::open_memory(16, Arc::clone(&metrics));
        let cache = NodeCache::new(stock, 2, true, metrics);

        let (index, handle) = cache.add(value_node(1)).unwrap();
        // Fresh nodes are unfrozen even in immutable mode.
        assert!(!handle.read().node.is_frozen());
        drop(handle);

        // Push the node out of the cache and load it again.
        for byte in 2..6u8 {
            cache.add(value_node(byte)).unwrap();
        }
        let reloaded = cache.get(index).unwrap();
        assert!(reloaded.read().node.is_frozen());
    }
}
