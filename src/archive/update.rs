//! Block updates and their canonical hashing.
//!
//! A [`BlockUpdate`] collects everything one block changed. The archive
//! slices it per account, hashes each slice (the *diff hash*) and chains
//! the result onto the account's running SHA-256 hash chain.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::common::{Address, Balance, Hash, Key, Nonce, Value};

use super::{ArchiveError, Result};

/// All state changes of a single block.
#[derive(Clone, Debug, Default)]
pub struct BlockUpdate {
    pub created_accounts: Vec<Address>,
    pub deleted_accounts: Vec<Address>,
    pub balances: Vec<(Address, Balance)>,
    pub nonces: Vec<(Address, Nonce)>,
    pub codes: Vec<(Address, Vec<u8>)>,
    pub storage: Vec<(Address, Key, Value)>,
}

impl BlockUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the (re-)creation of an account. Creation bumps the
    /// account's reincarnation counter, so clearing the storage of an
    /// existing account is also expressed as a creation event.
    pub fn create_account(&mut self, addr: Address) -> &mut Self {
        self.created_accounts.push(addr);
        self
    }

    pub fn delete_account(&mut self, addr: Address) -> &mut Self {
        self.deleted_accounts.push(addr);
        self
    }

    pub fn set_balance(&mut self, addr: Address, balance: Balance) -> &mut Self {
        self.balances.push((addr, balance));
        self
    }

    pub fn set_nonce(&mut self, addr: Address, nonce: Nonce) -> &mut Self {
        self.nonces.push((addr, nonce));
        self
    }

    pub fn set_code(&mut self, addr: Address, code: Vec<u8>) -> &mut Self {
        self.codes.push((addr, code));
        self
    }

    pub fn set_storage(&mut self, addr: Address, key: Key, value: Value) -> &mut Self {
        self.storage.push((addr, key, value));
        self
    }

    /// Returns true if the update carries no changes.
    pub fn is_empty(&self) -> bool {
        self.created_accounts.is_empty()
            && self.deleted_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.storage.is_empty()
    }

    /// Sorts all change lists into their canonical order and rejects
    /// contradicting or duplicate entries.
    pub fn normalize(&mut self) -> Result<()> {
        self.created_accounts.sort_unstable();
        self.created_accounts.dedup();
        self.deleted_accounts.sort_unstable();
        self.deleted_accounts.dedup();
        for addr in &self.created_accounts {
            if self.deleted_accounts.binary_search(addr).is_ok() {
                return Err(ArchiveError::InvalidUpdate(format!(
                    "account {addr} is both created and deleted"
                )));
            }
        }

        self.balances.sort_unstable_by_key(|(addr, _)| *addr);
        if has_duplicate_by(&self.balances, |(addr, _)| *addr) {
            return Err(ArchiveError::InvalidUpdate(
                "duplicate balance update".into(),
            ));
        }
        self.nonces.sort_unstable_by_key(|(addr, _)| *addr);
        if has_duplicate_by(&self.nonces, |(addr, _)| *addr) {
            return Err(ArchiveError::InvalidUpdate("duplicate nonce update".into()));
        }
        self.codes.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        if has_duplicate_by(&self.codes, |(addr, _)| *addr) {
            return Err(ArchiveError::InvalidUpdate("duplicate code update".into()));
        }
        self.storage
            .sort_unstable_by_key(|(addr, key, _)| (*addr, *key));
        if has_duplicate_by(&self.storage, |(addr, key, _)| (*addr, *key)) {
            return Err(ArchiveError::InvalidUpdate(
                "duplicate storage slot update".into(),
            ));
        }
        Ok(())
    }

    /// Splits the update into per-account slices, ordered by address.
    ///
    /// The update must be normalized.
    pub fn per_account(&self) -> Vec<AccountUpdate> {
        fn slot<'a>(
            accounts: &'a mut BTreeMap<Address, AccountUpdate>,
            addr: Address,
        ) -> &'a mut AccountUpdate {
            accounts.entry(addr).or_insert_with(|| AccountUpdate {
                address: addr,
                ..AccountUpdate::default()
            })
        }

        let mut accounts = BTreeMap::new();
        for addr in &self.created_accounts {
            slot(&mut accounts, *addr).created = true;
        }
        for addr in &self.deleted_accounts {
            slot(&mut accounts, *addr).deleted = true;
        }
        for (addr, balance) in &self.balances {
            slot(&mut accounts, *addr).balance = Some(*balance);
        }
        for (addr, nonce) in &self.nonces {
            slot(&mut accounts, *addr).nonce = Some(*nonce);
        }
        for (addr, code) in &self.codes {
            slot(&mut accounts, *addr).code = Some(code.clone());
        }
        for (addr, key, value) in &self.storage {
            slot(&mut accounts, *addr).storage.push((*key, *value));
        }
        accounts.into_values().collect()
    }
}

/// The changes one block applied to one account.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountUpdate {
    pub address: Address,
    pub created: bool,
    pub deleted: bool,
    pub balance: Option<Balance>,
    pub nonce: Option<Nonce>,
    pub code: Option<Vec<u8>>,
    /// Slot writes, sorted by key.
    pub storage: Vec<(Key, Value)>,
}

impl AccountUpdate {
    /// The canonical serialization the diff hash is computed over.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.storage.len() * 64);
        out.push(self.created as u8 | (self.deleted as u8) << 1);
        out.push(self.balance.is_some() as u8);
        if let Some(balance) = &self.balance {
            out.extend_from_slice(balance.as_bytes());
        }
        out.push(self.nonce.is_some() as u8);
        if let Some(nonce) = &self.nonce {
            out.extend_from_slice(nonce.as_bytes());
        }
        out.push(self.code.is_some() as u8);
        if let Some(code) = &self.code {
            out.extend_from_slice(&(code.len() as u32).to_be_bytes());
            out.extend_from_slice(code);
        }
        out.extend_from_slice(&(self.storage.len() as u32).to_be_bytes());
        for (key, value) in &self.storage {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// SHA-256 over the canonical bytes.
    pub fn diff_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        Hash(hasher.finalize().into())
    }
}

/// Advances an account's hash chain: `sha256(prev || diff)`.
pub fn chain_hash(prev: &Hash, diff: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(diff.as_bytes());
    Hash(hasher.finalize().into())
}

fn has_duplicate_by<T, K: PartialEq>(items: &[T], key: impl Fn(&T) -> K) -> bool {
    items.windows(2).any(|w| key(&w[0]) == key(&w[1]))
}
