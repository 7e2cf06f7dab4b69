//! The live trie: a single-root view onto a forest.
//!
//! Write operations thread the root id through the forest and keep the
//! latest root here. For file-backed tries the root id and hash are
//! persisted in `roots.dat` on every flush and restored on open.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::common::{AccountInfo, Address, Hash, Key, MemoryFootprint, Value};

use super::forest::{Forest, ForestConfig};
use super::node::NodeId;
use super::{MptConfig, MptError, Result};

const ROOTS_FILE_NAME: &str = "roots.dat";
/// One record: root id (8 bytes) followed by the root hash (32 bytes).
const ROOT_RECORD_SIZE: usize = 8 + 32;

/// A single trie over a forest.
pub struct LiveTrie {
    forest: Forest,
    root: Mutex<NodeId>,
    directory: Option<PathBuf>,
}

impl LiveTrie {
    /// Opens a live trie held entirely in memory.
    pub fn open_in_memory(config: MptConfig, forest_config: ForestConfig) -> Result<LiveTrie> {
        Ok(LiveTrie {
            forest: Forest::open_in_memory(config, forest_config)?,
            root: Mutex::new(NodeId::EMPTY),
            directory: None,
        })
    }

    /// Opens a file-backed live trie, restoring the persisted root.
    pub fn open_file(
        directory: impl AsRef<Path>,
        config: MptConfig,
        forest_config: ForestConfig,
    ) -> Result<LiveTrie> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| MptError::io(&directory, e))?;
        let forest = Forest::open_file(&directory, config, forest_config)?;
        let root = read_root(&directory.join(ROOTS_FILE_NAME))?;
        Ok(LiveTrie {
            forest,
            root: Mutex::new(root),
            directory: Some(directory),
        })
    }

    /// The current root node.
    pub fn root(&self) -> NodeId {
        *self.root.lock()
    }

    /// Grants access to the underlying forest.
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn get_account_info(&self, addr: &Address) -> Result<(AccountInfo, bool)> {
        self.forest.get_account_info(self.root(), addr)
    }

    pub fn set_account_info(&self, addr: &Address, info: &AccountInfo) -> Result<()> {
        let mut root = self.root.lock();
        *root = self.forest.set_account_info(*root, addr, info)?;
        Ok(())
    }

    pub fn get_value(&self, addr: &Address, key: &Key) -> Result<Value> {
        self.forest.get_value(self.root(), addr, key)
    }

    pub fn set_value(&self, addr: &Address, key: &Key, value: &Value) -> Result<()> {
        let mut root = self.root.lock();
        *root = self.forest.set_value(*root, addr, key, value)?;
        Ok(())
    }

    /// Drops all storage slots of the given account.
    pub fn clear_storage(&self, addr: &Address) -> Result<()> {
        let mut root = self.root.lock();
        *root = self.forest.clear_storage(*root, addr)?;
        Ok(())
    }

    /// Returns the root hash of the trie, refreshing stale hashes.
    pub fn get_hash(&self) -> Result<Hash> {
        self.forest.update_hashes_for(self.root())
    }

    /// Flushes the forest and persists the current root.
    pub fn flush(&self) -> Result<()> {
        // The hash is refreshed first so the persisted record is complete.
        let hash = self.get_hash()?;
        self.forest.flush()?;
        if let Some(directory) = &self.directory {
            write_root(&directory.join(ROOTS_FILE_NAME), self.root(), &hash)?;
        }
        Ok(())
    }

    /// Flushes and closes the trie and its forest.
    pub fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        match self.flush() {
            Ok(()) | Err(MptError::Closed) => {}
            Err(e) => errors.push(e),
        }
        if let Err(e) = self.forest.close() {
            errors.push(e);
        }
        MptError::join(errors)
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let mut footprint = MemoryFootprint::new(std::mem::size_of::<Self>());
        footprint.add_child("forest", self.forest.memory_footprint());
        footprint
    }
}

fn read_root(path: &Path) -> Result<NodeId> {
    if !path.exists() {
        return Ok(NodeId::EMPTY);
    }
    let data = fs::read(path).map_err(|e| MptError::io(path, e))?;
    if data.len() != ROOT_RECORD_SIZE {
        return Err(MptError::Corruption(format!(
            "malformed root record in {}",
            path.display()
        )));
    }
    let raw = u64::from_le_bytes(data[..8].try_into().unwrap());
    Ok(NodeId::from_raw(raw)?)
}

fn write_root(path: &Path, root: NodeId, hash: &Hash) -> Result<()> {
    let mut data = [0u8; ROOT_RECORD_SIZE];
    data[..8].copy_from_slice(&root.to_raw().to_le_bytes());
    data[8..].copy_from_slice(hash.as_bytes());
    let mut file = fs::File::create(path).map_err(|e| MptError::io(path, e))?;
    file.write_all(&data).map_err(|e| MptError::io(path, e))?;
    file.sync_all().map_err(|e| MptError::io(path, e))
}
