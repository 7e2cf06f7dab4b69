//! The account-centric state facade.
//!
//! `MptState` adapts a [`LiveTrie`] to the state contract used by the rest
//! of the system and maintains the content-addressed store of contract
//! codes, persisted as `codes.json` next to the trie files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::common::{AccountInfo, Address, Balance, Hash, Key, MemoryFootprint, Nonce, Value};

use super::forest::ForestConfig;
use super::live_trie::LiveTrie;
use super::lock::DirectoryLock;
use super::node::{keccak256, EMPTY_CODE_HASH};
use super::{MptConfig, MptError, Result};

const CODE_FILE_NAME: &str = "codes.json";

/// World state backed by a live Merkle Patricia Trie.
pub struct MptState {
    trie: LiveTrie,
    codes: Mutex<HashMap<Hash, Vec<u8>>>,
    code_file: Option<PathBuf>,
    lock: Mutex<Option<DirectoryLock>>,
}

impl MptState {
    /// Opens a volatile state held entirely in memory.
    pub fn open_in_memory(config: MptConfig, forest_config: ForestConfig) -> Result<MptState> {
        Ok(MptState {
            trie: LiveTrie::open_in_memory(config, forest_config)?,
            codes: Mutex::new(HashMap::new()),
            code_file: None,
            lock: Mutex::new(None),
        })
    }

    /// Opens a file-backed state in the given directory.
    ///
    /// The directory is locked exclusively (`~lock`); the trie lives under
    /// `live/`.
    pub fn open_file(
        directory: impl AsRef<Path>,
        config: MptConfig,
        forest_config: ForestConfig,
    ) -> Result<MptState> {
        let directory = directory.as_ref();
        let lock = DirectoryLock::acquire(directory)?;
        let live = directory.join("live");
        let trie = match LiveTrie::open_file(&live, config, forest_config) {
            Ok(trie) => trie,
            Err(e) => {
                // Do not leave a stale lock behind on a failed open.
                let _ = lock.release();
                return Err(e);
            }
        };
        let code_file = live.join(CODE_FILE_NAME);
        let codes = match read_codes(&code_file) {
            Ok(codes) => codes,
            Err(e) => {
                let _ = trie.close();
                let _ = lock.release();
                return Err(e);
            }
        };
        debug!(directory = %directory.display(), "state opened");
        Ok(MptState {
            trie,
            codes: Mutex::new(codes),
            code_file: Some(code_file),
            lock: Mutex::new(Some(lock)),
        })
    }

    /// Creates the account, or clears only its storage when it exists.
    pub fn create_account(&self, addr: &Address) -> Result<()> {
        let (_, exists) = self.trie.get_account_info(addr)?;
        if exists {
            return self.trie.clear_storage(addr);
        }
        self.trie.set_account_info(
            addr,
            &AccountInfo {
                code_hash: EMPTY_CODE_HASH,
                ..AccountInfo::default()
            },
        )
    }

    /// Returns whether the account exists.
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        Ok(self.trie.get_account_info(addr)?.1)
    }

    /// Removes the account and all of its storage.
    pub fn delete_account(&self, addr: &Address) -> Result<()> {
        self.trie.set_account_info(addr, &AccountInfo::default())
    }

    pub fn get_balance(&self, addr: &Address) -> Result<Balance> {
        let (info, exists) = self.trie.get_account_info(addr)?;
        Ok(if exists { info.balance } else { Balance::ZERO })
    }

    pub fn set_balance(&self, addr: &Address, balance: Balance) -> Result<()> {
        let (mut info, exists) = self.trie.get_account_info(addr)?;
        if info.balance == balance {
            return Ok(());
        }
        info.balance = balance;
        if !exists {
            info.code_hash = EMPTY_CODE_HASH;
        }
        self.trie.set_account_info(addr, &info)
    }

    pub fn get_nonce(&self, addr: &Address) -> Result<Nonce> {
        Ok(self.trie.get_account_info(addr)?.0.nonce)
    }

    pub fn set_nonce(&self, addr: &Address, nonce: Nonce) -> Result<()> {
        let (mut info, exists) = self.trie.get_account_info(addr)?;
        if info.nonce == nonce {
            return Ok(());
        }
        info.nonce = nonce;
        if !exists {
            info.code_hash = EMPTY_CODE_HASH;
        }
        self.trie.set_account_info(addr, &info)
    }

    pub fn get_storage(&self, addr: &Address, key: &Key) -> Result<Value> {
        self.trie.get_value(addr, key)
    }

    pub fn set_storage(&self, addr: &Address, key: &Key, value: &Value) -> Result<()> {
        self.trie.set_value(addr, key, value)
    }

    /// Returns the code of the account, or `None` if the account does not
    /// exist.
    pub fn get_code(&self, addr: &Address) -> Result<Option<Vec<u8>>> {
        let (info, exists) = self.trie.get_account_info(addr)?;
        if !exists {
            return Ok(None);
        }
        Ok(Some(
            self.codes
                .lock()
                .get(&info.code_hash)
                .cloned()
                .unwrap_or_default(),
        ))
    }

    pub fn get_code_size(&self, addr: &Address) -> Result<usize> {
        Ok(self.get_code(addr)?.map(|code| code.len()).unwrap_or(0))
    }

    /// Installs contract code, updating the account's code hash.
    ///
    /// Installing empty code on a non-existing account is a no-op.
    pub fn set_code(&self, addr: &Address, code: &[u8]) -> Result<()> {
        let code_hash = keccak256(code);
        let (mut info, exists) = self.trie.get_account_info(addr)?;
        if !exists && code.is_empty() {
            return Ok(());
        }
        if info.code_hash == code_hash {
            return Ok(());
        }
        info.code_hash = code_hash;
        self.codes.lock().insert(code_hash, code.to_vec());
        self.trie.set_account_info(addr, &info)
    }

    /// The code hash of the account; non-existing accounts report the hash
    /// of empty code.
    pub fn get_code_hash(&self, addr: &Address) -> Result<Hash> {
        let (info, exists) = self.trie.get_account_info(addr)?;
        Ok(if exists { info.code_hash } else { EMPTY_CODE_HASH })
    }

    /// The state root hash of the live trie.
    pub fn get_hash(&self) -> Result<Hash> {
        self.trie.get_hash()
    }

    /// Flushes codes and trie; both errors are surfaced if both fail.
    pub fn flush(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Some(path) = &self.code_file {
            if let Err(e) = write_codes(&self.codes.lock(), path) {
                errors.push(e);
            }
        }
        if let Err(e) = self.trie.flush() {
            errors.push(e);
        }
        MptError::join(errors)
    }

    /// Flushes and closes the state, releasing the directory lock.
    pub fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        match self.flush() {
            Ok(()) | Err(MptError::Closed) => {}
            Err(e) => errors.push(e),
        }
        if let Err(e) = self.trie.close() {
            errors.push(e);
        }
        if let Some(lock) = self.lock.lock().take() {
            if let Err(e) = lock.release() {
                errors.push(e);
            }
        }
        MptError::join(errors)
    }

    /// Grants access to the underlying live trie.
    pub fn trie(&self) -> &LiveTrie {
        &self.trie
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let codes = self.codes.lock();
        let code_bytes: usize = codes.values().map(|code| code.len()).sum();
        let mut footprint = MemoryFootprint::new(std::mem::size_of::<Self>());
        footprint.add_child("trie", self.trie.memory_footprint());
        footprint.add_child(
            "codes",
            MemoryFootprint::new(codes.len() * std::mem::size_of::<(Hash, Vec<u8>)>() + code_bytes),
        );
        footprint
    }
}

/// Parses a code file: a sequence of `[hash:32][length:4 BE][code]`.
///
/// A missing file yields an empty collection; trailing or missing bytes are
/// a corruption error.
fn read_codes(path: &Path) -> Result<HashMap<Hash, Vec<u8>>> {
    let mut codes = HashMap::new();
    if !path.exists() {
        return Ok(codes);
    }
    let data = fs::read(path).map_err(|e| MptError::io(path, e))?;
    let corrupted = || MptError::CorruptedCodeFile {
        path: path.to_path_buf(),
    };

    let mut offset = 0;
    while offset < data.len() {
        if data.len() - offset < 36 {
            return Err(corrupted());
        }
        let hash = Hash(data[offset..offset + 32].try_into().unwrap());
        let length =
            u32::from_be_bytes(data[offset + 32..offset + 36].try_into().unwrap()) as usize;
        offset += 36;
        if data.len() - offset < length {
            return Err(corrupted());
        }
        codes.insert(hash, data[offset..offset + length].to_vec());
        offset += length;
    }
    Ok(codes)
}

/// Writes the code collection in the format parsed by [`read_codes`].
fn write_codes(codes: &HashMap<Hash, Vec<u8>>, path: &Path) -> Result<()> {
    let mut data = Vec::new();
    for (hash, code) in codes.iter() {
        data.extend_from_slice(hash.as_bytes());
        data.extend_from_slice(&(code.len() as u32).to_be_bytes());
        data.extend_from_slice(code);
    }
    let mut file = fs::File::create(path).map_err(|e| MptError::io(path, e))?;
    file.write_all(&data).map_err(|e| MptError::io(path, e))?;
    file.sync_all().map_err(|e| MptError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(byte: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        Address(bytes)
    }

    fn state() -> MptState {
        MptState::open_in_memory(MptConfig::default(), ForestConfig::default()).unwrap()
    }

    #[test]
    fn test_create_account_installs_empty_code_hash() {
        let state = state();
        let addr = address(1);
        state.create_account(&addr).unwrap();
        assert!(state.exists(&addr).unwrap());
        assert_eq!(state.get_code_hash(&addr).unwrap(), EMPTY_CODE_HASH);
        assert_eq!(state.get_balance(&addr).unwrap(), Balance::ZERO);
    }

    #[test]
    fn test_create_existing_account_clears_storage_only() {
        let state = state();
        let addr = address(1);
        state.create_account(&addr).unwrap();
        state.set_balance(&addr, Balance::from_u64(10)).unwrap();
        let key = Key([1; 32]);
        state.set_storage(&addr, &key, &Value([2; 32])).unwrap();

        state.create_account(&addr).unwrap();
        assert_eq!(state.get_balance(&addr).unwrap(), Balance::from_u64(10));
        assert_eq!(state.get_storage(&addr, &key).unwrap(), Value::ZERO);
    }

    #[test]
    fn test_delete_account() {
        let state = state();
        let addr = address(1);
        state.set_nonce(&addr, Nonce::from_u64(4)).unwrap();
        assert!(state.exists(&addr).unwrap());

        state.delete_account(&addr).unwrap();
        assert!(!state.exists(&addr).unwrap());
        assert_eq!(state.get_nonce(&addr).unwrap(), Nonce::ZERO);
    }

    #[test]
    fn test_balance_update_preserves_code_hash() {
        let state = state();
        let addr = address(1);
        state.set_code(&addr, b"contract").unwrap();
        let code_hash = state.get_code_hash(&addr).unwrap();

        state.set_balance(&addr, Balance::from_u64(5)).unwrap();
        assert_eq!(state.get_code_hash(&addr).unwrap(), code_hash);
    }

    #[test]
    fn test_set_code_round_trip() {
        let state = state();
        let addr = address(1);
        // Empty code on a missing account changes nothing.
        state.set_code(&addr, &[]).unwrap();
        assert!(!state.exists(&addr).unwrap());

        state.set_code(&addr, b"runtime bytecode").unwrap();
        assert!(state.exists(&addr).unwrap());
        assert_eq!(
            state.get_code(&addr).unwrap().unwrap(),
            b"runtime bytecode".to_vec()
        );
        assert_eq!(state.get_code_size(&addr).unwrap(), 16);
        assert_eq!(state.get_code_hash(&addr).unwrap(), keccak256(b"runtime bytecode"));
    }

    #[test]
    fn test_code_of_missing_account() {
        let state = state();
        assert_eq!(state.get_code(&address(9)).unwrap(), None);
        assert_eq!(state.get_code_size(&address(9)).unwrap(), 0);
        assert_eq!(state.get_code_hash(&address(9)).unwrap(), EMPTY_CODE_HASH);
    }

    #[test]
    fn test_storage_round_trip() {
        let state = state();
        let addr = address(1);
        let key = Key([3; 32]);
        state.create_account(&addr).unwrap();
        state.set_storage(&addr, &key, &Value([7; 32])).unwrap();
        assert_eq!(state.get_storage(&addr, &key).unwrap(), Value([7; 32]));
    }

    #[test]
    fn test_code_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CODE_FILE_NAME);

        let mut codes = HashMap::new();
        codes.insert(keccak256(b"a"), b"a".to_vec());
        codes.insert(keccak256(b"bc"), b"bc".to_vec());
        codes.insert(keccak256(&[]), Vec::new());
        write_codes(&codes, &path).unwrap();

        assert_eq!(read_codes(&path).unwrap(), codes);
    }

    #[test]
    fn test_truncated_code_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CODE_FILE_NAME);

        let mut codes = HashMap::new();
        codes.insert(keccak256(b"code"), b"code".to_vec());
        write_codes(&codes, &path).unwrap();

        let mut data = fs::read(&path).unwrap();
        data.pop();
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            read_codes(&path),
            Err(MptError::CorruptedCodeFile { .. })
        ));
    }

    #[test]
    fn test_file_state_reopens_with_codes() {
        let dir = tempfile::tempdir().unwrap();
        let addr = address(1);
        {
            let state =
                MptState::open_file(dir.path(), MptConfig::default(), ForestConfig::default())
                    .unwrap();
            state.set_code(&addr, b"persistent code").unwrap();
            state.close().unwrap();
        }
        let state = MptState::open_file(dir.path(), MptConfig::default(), ForestConfig::default())
            .unwrap();
        assert_eq!(
            state.get_code(&addr).unwrap().unwrap(),
            b"persistent code".to_vec()
        );
        state.close().unwrap();
    }

    #[test]
    fn test_open_locks_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = MptState::open_file(dir.path(), MptConfig::default(), ForestConfig::default())
            .unwrap();
        assert!(matches!(
            MptState::open_file(dir.path(), MptConfig::default(), ForestConfig::default()),
            Err(MptError::LockContention { .. })
        ));
        state.close().unwrap();
    }
}
