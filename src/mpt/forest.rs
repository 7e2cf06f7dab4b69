//! The forest: a collection of tries sharing stocks and caches.
//!
//! All trie structure lives in four typed stocks (branches, extensions,
//! accounts, values) fronted by node caches. Multiple roots may share
//! subtrees; in `Mutable` mode writes rewrite nodes in place, in
//! `Immutable` mode writes path-copy frozen nodes so earlier roots keep
//! their exact state.
//!
//! Locking: every public operation holds read access on the forest lock;
//! `flush`/`close` take it exclusively, which also guarantees no node
//! handles are outstanding while caches are written back. Structural
//! writers and the hasher are serialized by a dedicated write lock; plain
//! readers run concurrently with either.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::{AccountInfo, Address, CachedHasher, Hash, Key, MemoryFootprint, Value};
use crate::store::{
    FilePageStore, MemoryPageStore, PageStore, ShadowPageStore, Stock, StoreMetrics,
    StoreMetricsSnapshot,
};

use super::cache::{NodeCache, NodeHandle, NodeReadGuard, NodeWriteGuard};
use super::nibbles::NibblePath;
use super::node::{AccountNode, BranchNode, ExtensionNode, Node, NodeId, NodeKind, ValueNode};
use super::{MptConfig, MptError, Result};

/// Whether writes rewrite nodes in place or path-copy frozen history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForestMode {
    /// Live mode: history is overwritten, ids are recycled eagerly.
    Mutable,
    /// Archive mode: frozen subtrees are immutable, writes path-copy.
    Immutable,
}

/// Forest configuration.
#[derive(Clone, Copy, Debug)]
pub struct ForestConfig {
    pub mode: ForestMode,
    /// Node cache capacity, shared evenly by the four variant caches.
    pub cache_capacity: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            mode: ForestMode::Mutable,
            cache_capacity: 1 << 16,
        }
    }
}

/// Page-pool capacity per stock, in pages.
const STOCK_POOL_CAPACITY: usize = 256;
/// Capacity of the hashed-address and hashed-key caches.
const HASHED_INPUT_CACHE_CAPACITY: usize = 1 << 14;

/// The pending update of a storage slot, see `storage_update`.
enum StorageOp<'a> {
    Set { key: &'a Key, value: &'a Value },
    Clear,
}

/// The leaf a trie mutation is aiming at.
enum LeafOp<'a> {
    Account {
        address: &'a Address,
        info: &'a AccountInfo,
    },
    Value {
        key: &'a Key,
        value: &'a Value,
    },
}

/// A disk-backed forest of Merkle Patricia Tries.
pub struct Forest {
    pub(crate) branches: NodeCache<BranchNode>,
    pub(crate) extensions: NodeCache<ExtensionNode>,
    pub(crate) accounts: NodeCache<AccountNode>,
    pub(crate) values: NodeCache<ValueNode>,
    pub(crate) address_hasher: CachedHasher<Address>,
    pub(crate) key_hasher: CachedHasher<Key>,
    pub(crate) config: MptConfig,
    mode: ForestMode,
    /// Read-held by all operations, write-held by flush/close.
    pub(crate) forest_lock: RwLock<()>,
    /// Serializes structural writers and the hasher.
    pub(crate) write_lock: Mutex<()>,
    metrics: Arc<StoreMetrics>,
    closed: AtomicBool,
}

impl Forest {
    /// Opens a forest kept entirely in memory.
    pub fn open_in_memory(config: MptConfig, forest_config: ForestConfig) -> Result<Forest> {
        let metrics = Arc::new(StoreMetrics::new());
        let freeze_loaded = forest_config.mode == ForestMode::Immutable;
        let capacity = per_variant_capacity(forest_config.cache_capacity);
        Ok(Self::assemble(
            NodeCache::new(
                Stock::open_memory(STOCK_POOL_CAPACITY, Arc::clone(&metrics)),
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            NodeCache::new(
                Stock::open_memory(STOCK_POOL_CAPACITY, Arc::clone(&metrics)),
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            NodeCache::new(
                Stock::open_memory(STOCK_POOL_CAPACITY, Arc::clone(&metrics)),
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            NodeCache::new(
                Stock::open_memory(STOCK_POOL_CAPACITY, Arc::clone(&metrics)),
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            config,
            forest_config,
            metrics,
        ))
    }

    /// Opens a file-backed forest in the given directory.
    ///
    /// Each node variant is stored in its own sub-directory.
    pub fn open_file(
        directory: impl AsRef<Path>,
        config: MptConfig,
        forest_config: ForestConfig,
    ) -> Result<Forest> {
        let directory = directory.as_ref();
        let metrics = Arc::new(StoreMetrics::new());
        let freeze_loaded = forest_config.mode == ForestMode::Immutable;
        let capacity = per_variant_capacity(forest_config.cache_capacity);

        let branches = Stock::open_file(
            directory.join("branches"),
            STOCK_POOL_CAPACITY,
            Arc::clone(&metrics),
        )?;
        let extensions = Stock::open_file(
            directory.join("extensions"),
            STOCK_POOL_CAPACITY,
            Arc::clone(&metrics),
        )?;
        let accounts = Stock::open_file(
            directory.join("accounts"),
            STOCK_POOL_CAPACITY,
            Arc::clone(&metrics),
        )?;
        let values = Stock::open_file(
            directory.join("values"),
            STOCK_POOL_CAPACITY,
            Arc::clone(&metrics),
        )?;
        debug!(directory = %directory.display(), "file forest opened");

        Ok(Self::assemble(
            NodeCache::new(branches, capacity, freeze_loaded, Arc::clone(&metrics)),
            NodeCache::new(extensions, capacity, freeze_loaded, Arc::clone(&metrics)),
            NodeCache::new(accounts, capacity, freeze_loaded, Arc::clone(&metrics)),
            NodeCache::new(values, capacity, freeze_loaded, Arc::clone(&metrics)),
            config,
            forest_config,
            metrics,
        ))
    }

    /// Opens a forest whose stocks run a file store and an in-memory store
    /// in lock step, comparing every page read. Stress testing only.
    pub fn open_shadow(
        directory: impl AsRef<Path>,
        config: MptConfig,
        forest_config: ForestConfig,
    ) -> Result<Forest> {
        let directory = directory.as_ref();
        let metrics = Arc::new(StoreMetrics::new());
        let freeze_loaded = forest_config.mode == ForestMode::Immutable;
        let capacity = per_variant_capacity(forest_config.cache_capacity);

        let mut stocks = Vec::new();
        for name in ["branches", "extensions", "accounts", "values"] {
            let dir = directory.join(name);
            std::fs::create_dir_all(&dir).map_err(|e| MptError::io(&dir, e))?;
            let store: Box<dyn PageStore> = Box::new(ShadowPageStore::new(
                FilePageStore::open(dir.join("pages"))?,
                MemoryPageStore::new(),
            ));
            stocks.push((store, dir));
        }
        // Assemble in reverse declaration order to keep the pops readable.
        let (values_store, values_dir) = stocks.pop().expect("four stocks");
        let (accounts_store, accounts_dir) = stocks.pop().expect("four stocks");
        let (extensions_store, extensions_dir) = stocks.pop().expect("four stocks");
        let (branches_store, branches_dir) = stocks.pop().expect("four stocks");

        Ok(Self::assemble(
            NodeCache::new(
                Stock::open_with_store(
                    branches_store,
                    Some(branches_dir),
                    STOCK_POOL_CAPACITY,
                    Arc::clone(&metrics),
                )?,
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            NodeCache::new(
                Stock::open_with_store(
                    extensions_store,
                    Some(extensions_dir),
                    STOCK_POOL_CAPACITY,
                    Arc::clone(&metrics),
                )?,
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            NodeCache::new(
                Stock::open_with_store(
                    accounts_store,
                    Some(accounts_dir),
                    STOCK_POOL_CAPACITY,
                    Arc::clone(&metrics),
                )?,
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            NodeCache::new(
                Stock::open_with_store(
                    values_store,
                    Some(values_dir),
                    STOCK_POOL_CAPACITY,
                    Arc::clone(&metrics),
                )?,
                capacity,
                freeze_loaded,
                Arc::clone(&metrics),
            ),
            config,
            forest_config,
            metrics,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        branches: NodeCache<BranchNode>,
        extensions: NodeCache<ExtensionNode>,
        accounts: NodeCache<AccountNode>,
        values: NodeCache<ValueNode>,
        config: MptConfig,
        forest_config: ForestConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Forest {
        Forest {
            branches,
            extensions,
            accounts,
            values,
            address_hasher: CachedHasher::new(HASHED_INPUT_CACHE_CAPACITY),
            key_hasher: CachedHasher::new(HASHED_INPUT_CACHE_CAPACITY),
            config,
            mode: forest_config.mode,
            forest_lock: RwLock::new(()),
            write_lock: Mutex::new(()),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the forest's operating mode.
    pub fn mode(&self) -> ForestMode {
        self.mode
    }

    /// Looks up the account info stored for `addr` under the given root.
    pub fn get_account_info(&self, root: NodeId, addr: &Address) -> Result<(AccountInfo, bool)> {
        let _forest = self.forest_lock.read();
        self.check_open()?;
        match self.find_account(root, addr)? {
            Some((_, info, _)) => Ok((info, true)),
            None => Ok((AccountInfo::default(), false)),
        }
    }

    /// Creates or updates the account for `addr`, returning the resulting
    /// root. Writing the all-zero info deletes the account.
    pub fn set_account_info(
        &self,
        root: NodeId,
        addr: &Address,
        info: &AccountInfo,
    ) -> Result<NodeId> {
        let _forest = self.forest_lock.read();
        let _write = self.write_lock.lock();
        self.check_open()?;
        let path = NibblePath::from_hash(&self.address_hasher.hash(*addr));
        let (new_root, _) = if info.is_empty() {
            self.remove_leaf(root, &path, 0, &LeafOp::Account {
                address: addr,
                info,
            })?
        } else {
            self.insert_leaf(root, &path, 0, &LeafOp::Account {
                address: addr,
                info,
            })?
        };
        Ok(new_root)
    }

    /// Reads the storage slot `key` of account `addr` under the given root.
    ///
    /// Missing accounts and missing slots read as the zero value.
    pub fn get_value(&self, root: NodeId, addr: &Address, key: &Key) -> Result<Value> {
        let _forest = self.forest_lock.read();
        self.check_open()?;
        let storage = match self.find_account(root, addr)? {
            Some((_, _, storage)) => storage,
            None => return Ok(Value::ZERO),
        };
        let path = NibblePath::from_hash(&self.key_hasher.hash(*key));
        self.find_value(storage, &path, key)
    }

    /// Writes the storage slot `key` of account `addr`, returning the
    /// resulting root. Writing to a non-existing account is a no-op; a zero
    /// value removes the slot.
    pub fn set_value(&self, root: NodeId, addr: &Address, key: &Key, value: &Value) -> Result<NodeId> {
        let _forest = self.forest_lock.read();
        let _write = self.write_lock.lock();
        self.check_open()?;
        let path = NibblePath::from_hash(&self.address_hasher.hash(*addr));
        let (new_root, _) =
            self.storage_update(root, &path, 0, addr, &StorageOp::Set { key, value })?;
        Ok(new_root)
    }

    /// Replaces the storage of account `addr` with the empty trie.
    pub fn clear_storage(&self, root: NodeId, addr: &Address) -> Result<NodeId> {
        let _forest = self.forest_lock.read();
        let _write = self.write_lock.lock();
        self.check_open()?;
        let path = NibblePath::from_hash(&self.address_hasher.hash(*addr));
        let (new_root, _) = self.storage_update(root, &path, 0, addr, &StorageOp::Clear)?;
        Ok(new_root)
    }

    /// Marks the whole subtree reachable from `root` immutable.
    ///
    /// Only meaningful in `Immutable` mode; later writes along frozen paths
    /// copy nodes instead of mutating them.
    pub fn freeze(&self, root: NodeId) -> Result<()> {
        let _forest = self.forest_lock.read();
        let _write = self.write_lock.lock();
        self.check_open()?;
        if self.mode != ForestMode::Immutable {
            return Err(MptError::Invariant(
                "freeze is only supported in immutable mode".into(),
            ));
        }
        self.freeze_subtree(root)
    }

    /// Verifies the structural invariants of the trie under `root`.
    pub fn check(&self, root: NodeId) -> Result<()> {
        let _forest = self.forest_lock.read();
        self.check_open()?;
        self.check_node(root, &NibblePath::EMPTY, false)
    }

    /// Writes all dirty nodes and pages back to their stores.
    pub fn flush(&self) -> Result<()> {
        let _forest = self.forest_lock.write();
        self.check_open()?;
        self.branches.flush()?;
        self.extensions.flush()?;
        self.accounts.flush()?;
        self.values.flush()?;
        debug!("forest flushed");
        Ok(())
    }

    /// Flushes and shuts the forest down. A second close is a no-op.
    pub fn close(&self) -> Result<()> {
        let _forest = self.forest_lock.write();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.branches.close()?;
        self.extensions.close()?;
        self.accounts.close()?;
        self.values.close()?;
        debug!("forest closed");
        Ok(())
    }

    /// Returns a snapshot of the storage counters.
    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reports the memory usage of the forest and its components.
    pub fn memory_footprint(&self) -> MemoryFootprint {
        let mut footprint = MemoryFootprint::new(std::mem::size_of::<Self>());
        footprint.add_child("branches", self.branches.memory_footprint());
        footprint.add_child("extensions", self.extensions.memory_footprint());
        footprint.add_child("accounts", self.accounts.memory_footprint());
        footprint.add_child("values", self.values.memory_footprint());
        footprint.add_child("hashed_addresses", self.address_hasher.memory_footprint());
        footprint.add_child("hashed_keys", self.key_hasher.memory_footprint());
        footprint
    }

    // --- node access -----------------------------------------------------

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MptError::Closed);
        }
        Ok(())
    }

    pub(crate) fn node_handle(&self, id: NodeId) -> Result<NodeHandle> {
        match id.kind() {
            NodeKind::Empty => Err(MptError::EmptyNodeAccess),
            NodeKind::Branch => Ok(self.branches.get(id.index())?),
            NodeKind::Extension => Ok(self.extensions.get(id.index())?),
            NodeKind::Account => Ok(self.accounts.get(id.index())?),
            NodeKind::Value => Ok(self.values.get(id.index())?),
        }
    }

    /// Acquires read access on a node.
    pub(crate) fn read_node(&self, id: NodeId) -> Result<NodeReadGuard> {
        Ok(self.node_handle(id)?.read_arc())
    }

    /// Acquires write access on a node for a structural mutation.
    ///
    /// Frozen nodes must never be mutated; callers clone them first via
    /// `ensure_writable`.
    pub(crate) fn write_node(&self, id: NodeId) -> Result<NodeWriteGuard> {
        let guard = self.node_handle(id)?.write_arc();
        if guard.node.is_frozen() {
            return Err(MptError::Invariant(format!(
                "write access on frozen node {id:?}"
            )));
        }
        Ok(guard)
    }

    /// Acquires write access for hash maintenance, which is permitted on
    /// frozen nodes (hashes are derived data, not content).
    pub(crate) fn write_node_for_hashing(&self, id: NodeId) -> Result<NodeWriteGuard> {
        Ok(self.node_handle(id)?.write_arc())
    }

    /// Returns an id that is safe to mutate: `id` itself when the node is
    /// unfrozen, or a fresh unfrozen copy (path-copy step) otherwise.
    fn ensure_writable(&self, id: NodeId) -> Result<NodeId> {
        let copy = {
            let guard = self.read_node(id)?;
            if !guard.node.is_frozen() {
                return Ok(id);
            }
            let mut copy = guard.node.clone();
            match &mut copy {
                Node::Branch(n) => n.frozen = false,
                Node::Extension(n) => n.frozen = false,
                Node::Account(n) => n.frozen = false,
                Node::Value(n) => n.frozen = false,
            }
            copy
        };
        self.add_node(copy)
    }

    /// Stores a new node in the stock of its variant.
    pub(crate) fn add_node(&self, node: Node) -> Result<NodeId> {
        Ok(match node {
            Node::Branch(n) => NodeId::branch(self.branches.add(n)?.0),
            Node::Extension(n) => NodeId::extension(self.extensions.add(n)?.0),
            Node::Account(n) => NodeId::account(self.accounts.add(n)?.0),
            Node::Value(n) => NodeId::value(self.values.add(n)?.0),
        })
    }

    /// Returns the node's id to its stock free list.
    fn release_node(&self, id: NodeId) {
        match id.kind() {
            NodeKind::Empty => {}
            NodeKind::Branch => self.branches.release(id.index()),
            NodeKind::Extension => self.extensions.release(id.index()),
            NodeKind::Account => self.accounts.release(id.index()),
            NodeKind::Value => self.values.release(id.index()),
        }
    }

    /// Releases every unfrozen node reachable from `id`. Frozen subtrees
    /// are retained: they belong to older roots.
    fn release_subtree(&self, id: NodeId) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        let children: Vec<NodeId> = {
            let guard = self.read_node(id)?;
            if guard.node.is_frozen() {
                return Ok(());
            }
            match &guard.node {
                Node::Branch(b) => b.children.iter().copied().collect(),
                Node::Extension(e) => vec![e.next],
                Node::Account(a) => vec![a.storage],
                Node::Value(_) => Vec::new(),
            }
        };
        for child in children {
            self.release_subtree(child)?;
        }
        self.release_node(id);
        Ok(())
    }

    // --- lookups ---------------------------------------------------------

    /// Walks the account trie towards `addr`; hand-over-hand read locking.
    fn find_account(
        &self,
        root: NodeId,
        addr: &Address,
    ) -> Result<Option<(NodeId, AccountInfo, NodeId)>> {
        if root.is_empty() {
            return Ok(None);
        }
        let path = NibblePath::from_hash(&self.address_hasher.hash(*addr));
        let mut pos = 0;
        let mut current = root;
        let mut guard = self.read_node(current)?;
        loop {
            let next = match &guard.node {
                Node::Branch(b) => {
                    let child = b.children[path.get(pos) as usize];
                    pos += 1;
                    child
                }
                Node::Extension(e) => {
                    let common = e.path.common_prefix_with(&path, pos);
                    if common < e.path.len() {
                        return Ok(None);
                    }
                    pos += common;
                    e.next
                }
                Node::Account(a) => {
                    if a.address == *addr {
                        return Ok(Some((current, a.info, a.storage)));
                    }
                    return Ok(None);
                }
                Node::Value(_) => {
                    return Err(MptError::Corruption(
                        "value node in account trie".into(),
                    ))
                }
            };
            if next.is_empty() {
                return Ok(None);
            }
            let next_guard = self.read_node(next)?;
            current = next;
            guard = next_guard;
        }
    }

    /// Walks a storage trie towards `key`.
    fn find_value(&self, root: NodeId, path: &NibblePath, key: &Key) -> Result<Value> {
        if root.is_empty() {
            return Ok(Value::ZERO);
        }
        let mut pos = 0;
        let mut guard = self.read_node(root)?;
        loop {
            let next = match &guard.node {
                Node::Branch(b) => {
                    let child = b.children[path.get(pos) as usize];
                    pos += 1;
                    child
                }
                Node::Extension(e) => {
                    let common = e.path.common_prefix_with(path, pos);
                    if common < e.path.len() {
                        return Ok(Value::ZERO);
                    }
                    pos += common;
                    e.next
                }
                Node::Value(v) => {
                    return Ok(if v.key == *key { v.value } else { Value::ZERO });
                }
                Node::Account(_) => {
                    return Err(MptError::Corruption(
                        "account node in storage trie".into(),
                    ))
                }
            };
            if next.is_empty() {
                return Ok(Value::ZERO);
            }
            let next_guard = self.read_node(next)?;
            guard = next_guard;
        }
    }

    // --- mutations -------------------------------------------------------

    /// Creates the leaf node an insert is targeting.
    fn make_leaf(&self, op: &LeafOp) -> Result<NodeId> {
        match op {
            LeafOp::Account { address, info } => {
                self.add_node(Node::Account(AccountNode::new(**address, **info)))
            }
            LeafOp::Value { key, value } => {
                self.add_node(Node::Value(ValueNode::new(**key, **value)))
            }
        }
    }

    /// Full 64-nibble path of an existing leaf node.
    fn leaf_path(&self, node: &Node) -> Result<NibblePath> {
        match node {
            Node::Account(a) => Ok(NibblePath::from_hash(&self.address_hasher.hash(a.address))),
            Node::Value(v) => Ok(NibblePath::from_hash(&self.key_hasher.hash(v.key))),
            _ => Err(MptError::Corruption("expected a leaf node".into())),
        }
    }

    /// Inserts or updates the leaf described by `op` along `path[pos..]`.
    ///
    /// Returns the id replacing `current` and whether anything changed.
    fn insert_leaf(
        &self,
        current: NodeId,
        path: &NibblePath,
        pos: usize,
        op: &LeafOp,
    ) -> Result<(NodeId, bool)> {
        if current.is_empty() {
            return Ok((self.make_leaf(op)?, true));
        }
        match current.kind() {
            NodeKind::Branch => {
                let nibble = path.get(pos);
                let child = {
                    let guard = self.read_node(current)?;
                    match &guard.node {
                        Node::Branch(b) => b.children[nibble as usize],
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                let (new_child, changed) = self.insert_leaf(child, path, pos + 1, op)?;
                if !changed {
                    return Ok((current, false));
                }
                let branch_id = self.ensure_writable(current)?;
                let mut guard = self.write_node(branch_id)?;
                if let Node::Branch(b) = &mut guard.node {
                    b.children[nibble as usize] = new_child;
                    b.mark_dirty(nibble);
                    b.set_embedded(nibble, false);
                    b.frozen_children &= !(1 << nibble);
                }
                guard.dirty = true;
                Ok((branch_id, true))
            }
            NodeKind::Extension => self.insert_into_extension(current, path, pos, op),
            NodeKind::Account | NodeKind::Value => self.insert_at_leaf(current, path, pos, op),
            NodeKind::Empty => unreachable!("handled above"),
        }
    }

    fn insert_into_extension(
        &self,
        current: NodeId,
        path: &NibblePath,
        pos: usize,
        op: &LeafOp,
    ) -> Result<(NodeId, bool)> {
        let (ext_path, next, next_hash, next_hash_dirty, next_embedded, frozen) = {
            let guard = self.read_node(current)?;
            match &guard.node {
                Node::Extension(e) => (
                    e.path,
                    e.next,
                    e.next_hash,
                    e.next_hash_dirty,
                    e.next_embedded,
                    e.frozen,
                ),
                _ => unreachable!("id kind mismatch"),
            }
        };
        let common = ext_path.common_prefix_with(path, pos);

        if common == ext_path.len() {
            // The lookup path runs through this extension.
            let (new_next, changed) = self.insert_leaf(next, path, pos + common, op)?;
            if !changed {
                return Ok((current, false));
            }
            let ext_id = self.ensure_writable(current)?;
            let mut guard = self.write_node(ext_id)?;
            if let Node::Extension(e) = &mut guard.node {
                e.next = new_next;
                e.next_hash_dirty = true;
                e.next_embedded = false;
            }
            guard.dirty = true;
            return Ok((ext_id, true));
        }

        // The paths diverge inside the extension: split it with a branch.
        let existing_nibble = ext_path.get(common);
        let new_nibble = path.get(pos + common);

        let existing_side = if common + 1 == ext_path.len() {
            next
        } else {
            // Tail extension carrying the rest of the old path.
            self.add_node(Node::Extension(ExtensionNode {
                path: ext_path.suffix(common + 1),
                next,
                next_hash,
                next_hash_dirty,
                next_embedded,
                frozen: false,
            }))?
        };

        let mut branch = BranchNode::new();
        branch.children[existing_nibble as usize] = existing_side;
        branch.mark_dirty(existing_nibble);
        branch.children[new_nibble as usize] = self.make_leaf(op)?;
        branch.mark_dirty(new_nibble);
        let branch_id = self.add_node(Node::Branch(branch))?;

        if common > 0 {
            if frozen {
                let prefix = ext_path.slice(0, common);
                let id = self.add_node(Node::Extension(ExtensionNode::new(prefix, branch_id)))?;
                Ok((id, true))
            } else {
                let mut guard = self.write_node(current)?;
                if let Node::Extension(e) = &mut guard.node {
                    e.path = ext_path.slice(0, common);
                    e.next = branch_id;
                    e.next_hash_dirty = true;
                    e.next_embedded = false;
                }
                guard.dirty = true;
                Ok((current, true))
            }
        } else {
            // The extension is replaced by the branch entirely.
            if !frozen {
                self.release_node(current);
            }
            Ok((branch_id, true))
        }
    }

    fn insert_at_leaf(
        &self,
        current: NodeId,
        path: &NibblePath,
        pos: usize,
        op: &LeafOp,
    ) -> Result<(NodeId, bool)> {
        enum Outcome {
            Matched { changed: bool },
            Diverged { existing_path: NibblePath },
        }
        let outcome = {
            let guard = self.read_node(current)?;
            match (&guard.node, op) {
                (Node::Account(a), LeafOp::Account { address, info }) => {
                    if a.address == **address {
                        Outcome::Matched {
                            changed: a.info != **info,
                        }
                    } else {
                        Outcome::Diverged {
                            existing_path: self.leaf_path(&guard.node)?,
                        }
                    }
                }
                (Node::Value(v), LeafOp::Value { key, value }) => {
                    if v.key == **key {
                        Outcome::Matched {
                            changed: v.value != **value,
                        }
                    } else {
                        Outcome::Diverged {
                            existing_path: self.leaf_path(&guard.node)?,
                        }
                    }
                }
                (Node::Account(_), LeafOp::Value { .. }) => {
                    return Err(MptError::Corruption(
                        "account node in storage trie".into(),
                    ))
                }
                (Node::Value(_), LeafOp::Account { .. }) => {
                    return Err(MptError::Corruption(
                        "value node in account trie".into(),
                    ))
                }
                _ => unreachable!("id kind mismatch"),
            }
        };

        match outcome {
            Outcome::Matched { changed: false } => Ok((current, false)),
            Outcome::Matched { changed: true } => {
                let id = self.ensure_writable(current)?;
                let mut guard = self.write_node(id)?;
                match (&mut guard.node, op) {
                    (Node::Account(a), LeafOp::Account { info, .. }) => a.info = **info,
                    (Node::Value(v), LeafOp::Value { value, .. }) => v.value = **value,
                    _ => unreachable!("variant checked above"),
                }
                guard.dirty = true;
                Ok((id, true))
            }
            Outcome::Diverged { existing_path } => {
                // Two leaves share the prefix up to `pos + common`; add the
                // minimal structure distinguishing them.
                let common = existing_path.suffix(pos).common_prefix_with(path, pos);
                let existing_nibble = existing_path.get(pos + common);
                let new_nibble = path.get(pos + common);

                let mut branch = BranchNode::new();
                branch.children[existing_nibble as usize] = current;
                branch.mark_dirty(existing_nibble);
                branch.children[new_nibble as usize] = self.make_leaf(op)?;
                branch.mark_dirty(new_nibble);
                let branch_id = self.add_node(Node::Branch(branch))?;

                if common > 0 {
                    let prefix = path.slice(pos, pos + common);
                    let id =
                        self.add_node(Node::Extension(ExtensionNode::new(prefix, branch_id)))?;
                    Ok((id, true))
                } else {
                    Ok((branch_id, true))
                }
            }
        }
    }

    /// Removes the leaf described by `op`, collapsing the structure on the
    /// way back up.
    fn remove_leaf(
        &self,
        current: NodeId,
        path: &NibblePath,
        pos: usize,
        op: &LeafOp,
    ) -> Result<(NodeId, bool)> {
        if current.is_empty() {
            return Ok((current, false));
        }
        match current.kind() {
            NodeKind::Branch => self.remove_from_branch(current, path, pos, op),
            NodeKind::Extension => {
                let (ext_path, next) = {
                    let guard = self.read_node(current)?;
                    match &guard.node {
                        Node::Extension(e) => (e.path, e.next),
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                if ext_path.common_prefix_with(path, pos) < ext_path.len() {
                    return Ok((current, false));
                }
                let (new_next, changed) = self.remove_leaf(next, path, pos + ext_path.len(), op)?;
                if !changed {
                    return Ok((current, false));
                }
                self.reattach_extension(current, new_next)
            }
            NodeKind::Account | NodeKind::Value => {
                let (matches, storage, frozen) = {
                    let guard = self.read_node(current)?;
                    let frozen = guard.node.is_frozen();
                    match (&guard.node, op) {
                        (Node::Account(a), LeafOp::Account { address, .. }) => {
                            (a.address == **address, a.storage, frozen)
                        }
                        (Node::Value(v), LeafOp::Value { key, .. }) => {
                            (v.key == **key, NodeId::EMPTY, frozen)
                        }
                        (Node::Account(_), LeafOp::Value { .. }) => {
                            return Err(MptError::Corruption(
                                "account node in storage trie".into(),
                            ))
                        }
                        (Node::Value(_), LeafOp::Account { .. }) => {
                            return Err(MptError::Corruption(
                                "value node in account trie".into(),
                            ))
                        }
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                if !matches {
                    return Ok((current, false));
                }
                self.release_subtree(storage)?;
                if !frozen {
                    self.release_node(current);
                }
                Ok((NodeId::EMPTY, true))
            }
            NodeKind::Empty => unreachable!("handled above"),
        }
    }

    fn remove_from_branch(
        &self,
        current: NodeId,
        path: &NibblePath,
        pos: usize,
        op: &LeafOp,
    ) -> Result<(NodeId, bool)> {
        let nibble = path.get(pos);
        let child = {
            let guard = self.read_node(current)?;
            match &guard.node {
                Node::Branch(b) => b.children[nibble as usize],
                _ => unreachable!("id kind mismatch"),
            }
        };
        if child.is_empty() {
            return Ok((current, false));
        }
        let (new_child, changed) = self.remove_leaf(child, path, pos + 1, op)?;
        if !changed {
            return Ok((current, false));
        }

        if !new_child.is_empty() {
            let branch_id = self.ensure_writable(current)?;
            let mut guard = self.write_node(branch_id)?;
            if let Node::Branch(b) = &mut guard.node {
                b.children[nibble as usize] = new_child;
                b.mark_dirty(nibble);
                b.set_embedded(nibble, false);
                b.frozen_children &= !(1 << nibble);
            }
            guard.dirty = true;
            return Ok((branch_id, true));
        }

        // The child is gone; the branch keeps living with two or more
        // children and collapses otherwise.
        let (remaining, frozen) = {
            let guard = self.read_node(current)?;
            match &guard.node {
                Node::Branch(b) => {
                    let remaining: Vec<(u8, NodeId)> = b
                        .children
                        .iter()
                        .enumerate()
                        .filter(|&(i, c)| i != nibble as usize && !c.is_empty())
                        .map(|(i, c)| (i as u8, *c))
                        .collect();
                    (remaining, b.frozen)
                }
                _ => unreachable!("id kind mismatch"),
            }
        };

        if remaining.len() >= 2 {
            let branch_id = self.ensure_writable(current)?;
            let mut guard = self.write_node(branch_id)?;
            if let Node::Branch(b) = &mut guard.node {
                b.children[nibble as usize] = NodeId::EMPTY;
                b.hashes[nibble as usize] = Hash::ZERO;
                b.dirty_hashes &= !(1 << nibble);
                b.set_embedded(nibble, false);
                b.frozen_children &= !(1 << nibble);
            }
            guard.dirty = true;
            return Ok((branch_id, true));
        }

        if remaining.is_empty() {
            return Err(MptError::Corruption(format!(
                "branch {current:?} had a single child before removal"
            )));
        }

        // A single child remains: the branch dissolves into it.
        let (last_nibble, last_child) = remaining[0];
        let replacement = match last_child.kind() {
            NodeKind::Branch => self.add_node(Node::Extension(ExtensionNode::new(
                NibblePath::from_nibbles(&[last_nibble]),
                last_child,
            )))?,
            NodeKind::Extension => {
                let child_id = self.ensure_writable(last_child)?;
                let mut guard = self.write_node(child_id)?;
                if let Node::Extension(e) = &mut guard.node {
                    e.path = e.path.prepend(last_nibble);
                }
                guard.dirty = true;
                child_id
            }
            NodeKind::Account | NodeKind::Value => last_child,
            NodeKind::Empty => unreachable!("remaining children are non-empty"),
        };
        if !frozen {
            self.release_node(current);
        }
        Ok((replacement, true))
    }

    /// Reconnects an extension to the result of a removal below it.
    fn reattach_extension(&self, current: NodeId, new_next: NodeId) -> Result<(NodeId, bool)> {
        let frozen = self.read_node(current)?.node.is_frozen();
        match new_next.kind() {
            NodeKind::Branch => {
                let ext_id = self.ensure_writable(current)?;
                let mut guard = self.write_node(ext_id)?;
                if let Node::Extension(e) = &mut guard.node {
                    e.next = new_next;
                    e.next_hash_dirty = true;
                    e.next_embedded = false;
                }
                guard.dirty = true;
                Ok((ext_id, true))
            }
            NodeKind::Extension => {
                // Two chained extensions merge into one.
                let prefix = {
                    let guard = self.read_node(current)?;
                    match &guard.node {
                        Node::Extension(e) => e.path,
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                let merged_id = self.ensure_writable(new_next)?;
                let mut guard = self.write_node(merged_id)?;
                if let Node::Extension(e) = &mut guard.node {
                    e.path = prefix.concat(&e.path);
                }
                guard.dirty = true;
                drop(guard);
                if !frozen {
                    self.release_node(current);
                }
                Ok((merged_id, true))
            }
            NodeKind::Account | NodeKind::Value => {
                // The extension in front of a leaf carries no information.
                if !frozen {
                    self.release_node(current);
                }
                Ok((new_next, true))
            }
            NodeKind::Empty => Err(MptError::Corruption(
                "extension child removed entirely".into(),
            )),
        }
    }

    /// Locates the account owning the storage slot update and applies the
    /// operation to its storage trie.
    fn storage_update(
        &self,
        current: NodeId,
        path: &NibblePath,
        pos: usize,
        addr: &Address,
        op: &StorageOp,
    ) -> Result<(NodeId, bool)> {
        if current.is_empty() {
            // No such account: slot updates are a no-op.
            return Ok((current, false));
        }
        match current.kind() {
            NodeKind::Branch => {
                let nibble = path.get(pos);
                let child = {
                    let guard = self.read_node(current)?;
                    match &guard.node {
                        Node::Branch(b) => b.children[nibble as usize],
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                let (new_child, changed) = self.storage_update(child, path, pos + 1, addr, op)?;
                if !changed {
                    return Ok((current, false));
                }
                let branch_id = self.ensure_writable(current)?;
                let mut guard = self.write_node(branch_id)?;
                if let Node::Branch(b) = &mut guard.node {
                    b.children[nibble as usize] = new_child;
                    b.mark_dirty(nibble);
                    b.set_embedded(nibble, false);
                    b.frozen_children &= !(1 << nibble);
                }
                guard.dirty = true;
                Ok((branch_id, true))
            }
            NodeKind::Extension => {
                let (ext_path, next) = {
                    let guard = self.read_node(current)?;
                    match &guard.node {
                        Node::Extension(e) => (e.path, e.next),
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                if ext_path.common_prefix_with(path, pos) < ext_path.len() {
                    return Ok((current, false));
                }
                let (new_next, changed) =
                    self.storage_update(next, path, pos + ext_path.len(), addr, op)?;
                if !changed {
                    return Ok((current, false));
                }
                let ext_id = self.ensure_writable(current)?;
                let mut guard = self.write_node(ext_id)?;
                if let Node::Extension(e) = &mut guard.node {
                    e.next = new_next;
                    e.next_hash_dirty = true;
                    e.next_embedded = false;
                }
                guard.dirty = true;
                Ok((ext_id, true))
            }
            NodeKind::Account => {
                let (owner, storage) = {
                    let guard = self.read_node(current)?;
                    match &guard.node {
                        Node::Account(a) => (a.address, a.storage),
                        _ => unreachable!("id kind mismatch"),
                    }
                };
                if owner != *addr {
                    return Ok((current, false));
                }
                let (new_storage, changed) = match op {
                    StorageOp::Set { key, value } => {
                        let key_path = NibblePath::from_hash(&self.key_hasher.hash(**key));
                        let leaf = LeafOp::Value {
                            key: *key,
                            value: *value,
                        };
                        if value.is_zero() {
                            self.remove_leaf(storage, &key_path, 0, &leaf)?
                        } else {
                            self.insert_leaf(storage, &key_path, 0, &leaf)?
                        }
                    }
                    StorageOp::Clear => {
                        if storage.is_empty() {
                            return Ok((current, false));
                        }
                        self.release_subtree(storage)?;
                        (NodeId::EMPTY, true)
                    }
                };
                if !changed {
                    return Ok((current, false));
                }
                let account_id = self.ensure_writable(current)?;
                let mut guard = self.write_node(account_id)?;
                if let Node::Account(a) = &mut guard.node {
                    a.storage = new_storage;
                    a.storage_hash_dirty = true;
                }
                guard.dirty = true;
                Ok((account_id, true))
            }
            NodeKind::Value => Err(MptError::Corruption("value node in account trie".into())),
            NodeKind::Empty => unreachable!("handled above"),
        }
    }

    // --- freezing --------------------------------------------------------

    fn freeze_subtree(&self, id: NodeId) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        let handle = self.node_handle(id)?;
        let children: Vec<NodeId> = {
            let guard = handle.read_arc();
            if guard.node.is_frozen() {
                return Ok(());
            }
            match &guard.node {
                Node::Branch(b) => b
                    .children
                    .iter()
                    .enumerate()
                    .filter(|(i, c)| !c.is_empty() && b.frozen_children & (1 << i) == 0)
                    .map(|(_, c)| *c)
                    .collect(),
                Node::Extension(e) => vec![e.next],
                Node::Account(a) => vec![a.storage],
                Node::Value(_) => Vec::new(),
            }
        };
        for child in children {
            self.freeze_subtree(child)?;
        }
        handle.write_arc().node.set_frozen();
        Ok(())
    }

    // --- verification ----------------------------------------------------

    /// Recursively verifies structural invariants under `id`.
    fn check_node(&self, id: NodeId, prefix: &NibblePath, in_storage: bool) -> Result<()> {
        if id.is_empty() {
            return Ok(());
        }
        let guard = self.read_node(id)?;
        match &guard.node {
            Node::Branch(b) => {
                if b.child_count() < 2 {
                    return Err(MptError::Corruption(format!(
                        "branch {id:?} has {} children",
                        b.child_count()
                    )));
                }
                let children = b.children;
                let hashes = b.hashes;
                let dirty_hashes = b.dirty_hashes;
                drop(guard);
                for (i, child) in children.iter().enumerate() {
                    if child.is_empty() {
                        continue;
                    }
                    let sub_prefix = prefix.concat(&NibblePath::from_nibbles(&[i as u8]));
                    // Clean embedded hashes must match a recomputation; a
                    // clean bit over a dirty child breaks the dirty-hash
                    // invariant as well.
                    if dirty_hashes & (1 << i) == 0 {
                        match self.readonly_node_hash(*child, sub_prefix.len())? {
                            Some(hash) if hash == hashes[i] => {}
                            Some(_) => {
                                return Err(MptError::Corruption(format!(
                                    "stale child hash at nibble {i} of branch {id:?}"
                                )))
                            }
                            None => {
                                return Err(MptError::Corruption(format!(
                                    "clean child hash over a dirty subtree at nibble {i} of \
                                     branch {id:?}"
                                )))
                            }
                        }
                    }
                    self.check_node(*child, &sub_prefix, in_storage)?;
                }
                Ok(())
            }
            Node::Extension(e) => {
                if e.path.is_empty() {
                    return Err(MptError::Corruption(format!(
                        "extension {id:?} has an empty path"
                    )));
                }
                if e.next.kind() != NodeKind::Branch {
                    return Err(MptError::Corruption(format!(
                        "extension {id:?} points at a {:?} node",
                        e.next.kind()
                    )));
                }
                let sub_prefix = prefix.concat(&e.path);
                let next = e.next;
                let next_hash = e.next_hash;
                let next_hash_dirty = e.next_hash_dirty;
                drop(guard);
                if !next_hash_dirty {
                    match self.readonly_node_hash(next, sub_prefix.len())? {
                        Some(hash) if hash == next_hash => {}
                        _ => {
                            return Err(MptError::Corruption(format!(
                                "stale child hash of extension {id:?}"
                            )))
                        }
                    }
                }
                self.check_node(next, &sub_prefix, in_storage)
            }
            Node::Account(a) => {
                if in_storage {
                    return Err(MptError::Corruption(
                        "account node in storage trie".into(),
                    ));
                }
                let full = NibblePath::from_hash(&self.address_hasher.hash(a.address));
                if full.slice(0, prefix.len()) != *prefix {
                    return Err(MptError::Corruption(format!(
                        "account {id:?} stored off its hashed path"
                    )));
                }
                let storage = a.storage;
                let storage_hash = a.storage_hash;
                let storage_hash_dirty = a.storage_hash_dirty;
                drop(guard);
                if !storage_hash_dirty {
                    match self.readonly_node_hash(storage, 0)? {
                        Some(hash) if hash == storage_hash => {}
                        _ => {
                            return Err(MptError::Corruption(format!(
                                "stale storage root hash of account {id:?}"
                            )))
                        }
                    }
                }
                self.check_node(storage, &NibblePath::EMPTY, true)
            }
            Node::Value(v) => {
                if !in_storage {
                    return Err(MptError::Corruption("value node in account trie".into()));
                }
                let full = NibblePath::from_hash(&self.key_hasher.hash(v.key));
                if full.slice(0, prefix.len()) != *prefix {
                    return Err(MptError::Corruption(format!(
                        "value {id:?} stored off its hashed path"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn per_variant_capacity(total: usize) -> usize {
    (total / 4).max(16)
}
