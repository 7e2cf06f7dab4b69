//! The archive: per-block history in an embedded SQLite database.
//!
//! Every inserted block appends its changes to append-only tables; each
//! account additionally carries a SHA-256 hash chain over its per-block
//! diffs, which makes the whole archive content-verifiable. Storage slots
//! are scoped by a per-account *reincarnation* counter bumped on every
//! create/delete event, so slots written before a deletion never leak into
//! a later incarnation.

mod update;

pub use update::{chain_hash, AccountUpdate, BlockUpdate};

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::common::{Address, Balance, Hash, Key, MemoryFootprint, Nonce, Value};

/// File name of the archive database inside a state directory.
pub const ARCHIVE_FILE_NAME: &str = "archive.sqlite";

/// Archive errors.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),
    #[error("archive is closed")]
    Closed,
    #[error("corrupted archive: {0}")]
    Corruption(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

/// Result type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

const SCHEMA: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS block (number INT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS account_hash (account BLOB, block INT, hash BLOB, \
     PRIMARY KEY (account, block))",
    "CREATE TABLE IF NOT EXISTS status (account BLOB, block INT, exist INT, \
     reincarnation INT, PRIMARY KEY (account, block))",
    "CREATE TABLE IF NOT EXISTS balance (account BLOB, block INT, value BLOB, \
     PRIMARY KEY (account, block))",
    "CREATE TABLE IF NOT EXISTS nonce (account BLOB, block INT, value BLOB, \
     PRIMARY KEY (account, block))",
    "CREATE TABLE IF NOT EXISTS code (account BLOB, block INT, code BLOB, \
     PRIMARY KEY (account, block))",
    "CREATE TABLE IF NOT EXISTS storage (account BLOB, reincarnation INT, slot BLOB, \
     block INT, value BLOB, PRIMARY KEY (account, reincarnation, slot, block))",
];

const ADD_BLOCK: &str = "INSERT INTO block (number) VALUES (?1)";
const GET_BLOCK_HEIGHT: &str = "SELECT number FROM block ORDER BY number DESC LIMIT 1";
const CREATE_ACCOUNT: &str = "INSERT INTO status (account, block, exist, reincarnation) \
     VALUES (?1, ?2, 1, (SELECT IFNULL(MAX(reincarnation) + 1, 0) FROM status WHERE account = ?1))";
const DELETE_ACCOUNT: &str = "INSERT INTO status (account, block, exist, reincarnation) \
     VALUES (?1, ?2, 0, (SELECT IFNULL(MAX(reincarnation) + 1, 0) FROM status WHERE account = ?1))";
const GET_STATUS: &str = "SELECT exist FROM status WHERE account = ?1 AND block <= ?2 \
     ORDER BY block DESC LIMIT 1";
const ADD_BALANCE: &str = "INSERT INTO balance (account, block, value) VALUES (?1, ?2, ?3)";
const GET_BALANCE: &str = "SELECT value FROM balance WHERE account = ?1 AND block <= ?2 \
     ORDER BY block DESC LIMIT 1";
const ADD_NONCE: &str = "INSERT INTO nonce (account, block, value) VALUES (?1, ?2, ?3)";
const GET_NONCE: &str = "SELECT value FROM nonce WHERE account = ?1 AND block <= ?2 \
     ORDER BY block DESC LIMIT 1";
const ADD_CODE: &str = "INSERT INTO code (account, block, code) VALUES (?1, ?2, ?3)";
const GET_CODE: &str = "SELECT code FROM code WHERE account = ?1 AND block <= ?2 \
     ORDER BY block DESC LIMIT 1";
const ADD_VALUE: &str = "INSERT INTO storage (account, reincarnation, slot, block, value) \
     VALUES (?1, (SELECT IFNULL(MAX(reincarnation), 0) FROM status WHERE account = ?1 \
     AND block <= ?2), ?3, ?2, ?4)";
const GET_VALUE: &str = "SELECT value FROM storage WHERE account = ?1 AND reincarnation = \
     (SELECT IFNULL(MAX(reincarnation), 0) FROM status WHERE account = ?1 AND block <= ?2) \
     AND slot = ?3 AND block <= ?2 ORDER BY block DESC LIMIT 1";
const ADD_ACCOUNT_HASH: &str =
    "INSERT INTO account_hash (account, block, hash) VALUES (?1, ?2, ?3)";
const GET_ACCOUNT_HASH: &str = "SELECT hash FROM account_hash WHERE account = ?1 AND \
     block <= ?2 ORDER BY block DESC LIMIT 1";
const GET_ARCHIVE_HASH: &str = "SELECT hash FROM account_hash a INNER JOIN (SELECT account, \
     MAX(block) AS block FROM account_hash WHERE block <= ?1 GROUP BY account) b \
     ON a.account = b.account AND a.block = b.block ORDER BY a.account";
const GET_ACCOUNT_LIST: &str =
    "SELECT DISTINCT account FROM account_hash WHERE block <= ?1 ORDER BY account";

/// An append-only archive of per-block state updates.
pub struct Archive {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl Archive {
    /// Opens (or creates) the archive database in the given directory.
    pub fn open(directory: impl AsRef<Path>) -> Result<Archive> {
        let path = directory.as_ref().join(ARCHIVE_FILE_NAME);
        Self::open_database(path)
    }

    /// Opens (or creates) an archive database at an explicit file path.
    pub fn open_database(path: impl Into<PathBuf>) -> Result<Archive> {
        let path = path.into();
        let conn = Connection::open(&path)?;
        // WAL keeps readers unblocked by the single writer. The pragma
        // returns the new mode as a row, so it is read as a query.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        for statement in SCHEMA {
            conn.execute(statement, [])?;
        }
        debug!(path = %path.display(), "archive opened");
        Ok(Archive {
            conn: Mutex::new(Some(conn)),
            path,
        })
    }

    /// Appends the update of the given block.
    ///
    /// The whole insert runs in one transaction; blocks must be inserted
    /// with strictly increasing numbers.
    pub fn add(&self, block: u64, update: &BlockUpdate) -> Result<()> {
        let block = to_sql_block(block)?;
        let mut update = update.clone();
        update.normalize()?;

        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(ArchiveError::Closed)?;

        if let Some(last) = last_block(conn)? {
            if block <= last {
                return Err(ArchiveError::PreconditionViolated(format!(
                    "unable to insert block {block}, archive already contains block {last}"
                )));
            }
        }

        let tx = conn.transaction()?;
        {
            tx.prepare_cached(ADD_BLOCK)?.execute(params![block])?;

            for addr in &update.deleted_accounts {
                tx.prepare_cached(DELETE_ACCOUNT)?
                    .execute(params![addr.as_bytes(), block])?;
            }
            for addr in &update.created_accounts {
                tx.prepare_cached(CREATE_ACCOUNT)?
                    .execute(params![addr.as_bytes(), block])?;
            }
            for (addr, balance) in &update.balances {
                tx.prepare_cached(ADD_BALANCE)?
                    .execute(params![addr.as_bytes(), block, balance.as_bytes()])?;
            }
            for (addr, nonce) in &update.nonces {
                tx.prepare_cached(ADD_NONCE)?
                    .execute(params![addr.as_bytes(), block, nonce.as_bytes()])?;
            }
            for (addr, code) in &update.codes {
                tx.prepare_cached(ADD_CODE)?
                    .execute(params![addr.as_bytes(), block, code])?;
            }
            for (addr, key, value) in &update.storage {
                tx.prepare_cached(ADD_VALUE)?.execute(params![
                    addr.as_bytes(),
                    block,
                    key.as_bytes(),
                    value.as_bytes()
                ])?;
            }

            // Advance the per-account hash chains in the same transaction.
            for account_update in update.per_account() {
                let prev: Hash = tx
                    .prepare_cached(GET_ACCOUNT_HASH)?
                    .query_row(params![account_update.address.as_bytes(), block], |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()?
                    .map(|bytes| decode_hash(&bytes))
                    .transpose()?
                    .unwrap_or(Hash::ZERO);
                let next = chain_hash(&prev, &account_update.diff_hash());
                tx.prepare_cached(ADD_ACCOUNT_HASH)?.execute(params![
                    account_update.address.as_bytes(),
                    block,
                    next.as_bytes()
                ])?;
            }
        }
        tx.commit()?;
        debug!(block, "block added to archive");
        Ok(())
    }

    /// The highest block number inserted so far.
    pub fn get_last_block_height(&self) -> Result<Option<u64>> {
        self.with_conn(|conn| Ok(last_block(conn)?.map(|b| b as u64)))
    }

    /// Returns whether the account existed at the given block height.
    pub fn exists(&self, block: u64, addr: &Address) -> Result<bool> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            let exist: Option<i64> = conn
                .prepare_cached(GET_STATUS)?
                .query_row(params![addr.as_bytes(), block], |row| row.get(0))
                .optional()?;
            Ok(exist.unwrap_or(0) != 0)
        })
    }

    /// The account's balance as of the given block; zero when never set.
    pub fn get_balance(&self, block: u64, addr: &Address) -> Result<Balance> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_BALANCE)?
                .query_row(params![addr.as_bytes(), block], |row| row.get(0))
                .optional()?;
            match bytes {
                Some(bytes) => Balance::from_slice(&bytes).ok_or_else(|| {
                    ArchiveError::Corruption("malformed balance value".into())
                }),
                None => Ok(Balance::ZERO),
            }
        })
    }

    /// The account's nonce as of the given block; zero when never set.
    pub fn get_nonce(&self, block: u64, addr: &Address) -> Result<Nonce> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_NONCE)?
                .query_row(params![addr.as_bytes(), block], |row| row.get(0))
                .optional()?;
            match bytes {
                Some(bytes) => Nonce::from_slice(&bytes)
                    .ok_or_else(|| ArchiveError::Corruption("malformed nonce value".into())),
                None => Ok(Nonce::ZERO),
            }
        })
    }

    /// The account's code as of the given block; empty when never set.
    pub fn get_code(&self, block: u64, addr: &Address) -> Result<Vec<u8>> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            let code: Option<Vec<u8>> = conn
                .prepare_cached(GET_CODE)?
                .query_row(params![addr.as_bytes(), block], |row| row.get(0))
                .optional()?;
            Ok(code.unwrap_or_default())
        })
    }

    /// The value of a storage slot as of the given block, respecting the
    /// account's reincarnation at that height.
    pub fn get_storage(&self, block: u64, addr: &Address, key: &Key) -> Result<Value> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_VALUE)?
                .query_row(params![addr.as_bytes(), block, key.as_bytes()], |row| {
                    row.get(0)
                })
                .optional()?;
            match bytes {
                Some(bytes) => Value::from_slice(&bytes)
                    .ok_or_else(|| ArchiveError::Corruption("malformed slot value".into())),
                None => Ok(Value::ZERO),
            }
        })
    }

    /// The account's hash-chain value as of the given block.
    pub fn get_account_hash(&self, block: u64, addr: &Address) -> Result<Hash> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| account_hash(conn, block, addr))
    }

    /// The archive hash at the given block: a streaming SHA-256 over the
    /// latest per-account hashes, ordered by address.
    pub fn get_hash(&self, block: u64) -> Result<Hash> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| archive_hash(conn, block))
    }

    /// All accounts touched up to the given block, ordered by address.
    pub fn get_account_list(&self, block: u64) -> Result<Vec<Address>> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(GET_ACCOUNT_LIST)?;
            let mut rows = stmt.query(params![block])?;
            let mut accounts = Vec::new();
            while let Some(row) = rows.next()? {
                let bytes: Vec<u8> = row.get(0)?;
                accounts.push(Address::from_slice(&bytes).ok_or_else(|| {
                    ArchiveError::Corruption("malformed account address".into())
                })?);
            }
            Ok(accounts)
        })
    }

    /// Verifies the archive content up to `block` against the expected
    /// archive hash: database integrity, every account's replayed hash
    /// chain, and the absence of rows not covered by any hash.
    pub fn verify(&self, block: u64, expected_hash: &Hash) -> Result<()> {
        let block = to_sql_block(block)?;
        self.with_conn(|conn| {
            // Database-level integrity first.
            let mut issues = Vec::new();
            let mut stmt = conn.prepare("PRAGMA integrity_check")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let message: String = row.get(0)?;
                if message != "ok" {
                    issues.push(message);
                }
            }
            drop(rows);
            drop(stmt);
            if !issues.is_empty() {
                return Err(ArchiveError::Corruption(format!(
                    "database integrity issues: {}",
                    issues.join("; ")
                )));
            }

            if archive_hash(conn, block)? != *expected_hash {
                return Err(ArchiveError::Corruption(
                    "archive hash does not match expected hash".into(),
                ));
            }

            let accounts = {
                let mut stmt = conn.prepare_cached(GET_ACCOUNT_LIST)?;
                let mut rows = stmt.query(params![block])?;
                let mut accounts = Vec::new();
                while let Some(row) = rows.next()? {
                    let bytes: Vec<u8> = row.get(0)?;
                    accounts.push(Address::from_slice(&bytes).ok_or_else(|| {
                        ArchiveError::Corruption("malformed account address".into())
                    })?);
                }
                accounts
            };
            for account in &accounts {
                verify_account(conn, block, account)?;
            }

            // No content row may exist without a matching hash row.
            for table in ["status", "balance", "nonce", "code", "storage"] {
                let orphan: Option<i64> = conn
                    .prepare(&format!(
                        "SELECT 1 FROM (SELECT account FROM {table} WHERE block <= ?1 \
                         EXCEPT SELECT account FROM account_hash WHERE block <= ?1) LIMIT 1"
                    ))?
                    .query_row(params![block], |row| row.get(0))
                    .optional()?;
                if orphan.is_some() {
                    return Err(ArchiveError::Corruption(format!(
                        "found extra row of data in table `{table}`"
                    )));
                }
            }
            Ok(())
        })
    }

    /// Nothing is buffered outside SQLite; flushing is a no-op.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Closes the database. A second close is a no-op.
    pub fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, e)| ArchiveError::Sql(e))?;
            debug!(path = %self.path.display(), "archive closed");
        }
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        MemoryFootprint::new(std::mem::size_of::<Self>())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(ArchiveError::Closed)?;
        f(conn)
    }
}

fn to_sql_block(block: u64) -> Result<i64> {
    i64::try_from(block)
        .map_err(|_| ArchiveError::PreconditionViolated(format!("block number {block} too large")))
}

fn last_block(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn
        .prepare_cached(GET_BLOCK_HEIGHT)?
        .query_row([], |row| row.get(0))
        .optional()?)
}

fn decode_hash(bytes: &[u8]) -> Result<Hash> {
    Hash::from_slice(bytes).ok_or_else(|| ArchiveError::Corruption("malformed hash value".into()))
}

fn account_hash(conn: &Connection, block: i64, addr: &Address) -> Result<Hash> {
    let bytes: Option<Vec<u8>> = conn
        .prepare_cached(GET_ACCOUNT_HASH)?
        .query_row(params![addr.as_bytes(), block], |row| row.get(0))
        .optional()?;
    match bytes {
        Some(bytes) => decode_hash(&bytes),
        None => Ok(Hash::ZERO),
    }
}

fn archive_hash(conn: &Connection, block: i64) -> Result<Hash> {
    let mut stmt = conn.prepare_cached(GET_ARCHIVE_HASH)?;
    let mut rows = stmt.query(params![block])?;
    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        let bytes: Vec<u8> = row.get(0)?;
        hasher.update(&bytes);
    }
    Ok(Hash(hasher.finalize().into()))
}

/// Replays all diffs of one account and compares the recomputed hash chain
/// with the stored one.
fn verify_account(conn: &Connection, block: i64, addr: &Address) -> Result<()> {
    let account = addr.as_bytes().as_slice();

    let hash_rows: Vec<(i64, Hash)> = {
        let mut stmt = conn.prepare(
            "SELECT block, hash FROM account_hash WHERE account = ?1 AND block <= ?2 \
             ORDER BY block",
        )?;
        let mut rows = stmt.query(params![account, block])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(1)?;
            out.push((row.get(0)?, decode_hash(&bytes)?));
        }
        out
    };

    let status_rows: Vec<(i64, bool)> = {
        let mut stmt = conn.prepare(
            "SELECT block, exist FROM status WHERE account = ?1 AND block <= ?2 ORDER BY block",
        )?;
        let mut rows = stmt.query(params![account, block])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get::<_, i64>(1)? != 0));
        }
        out
    };

    let balance_rows: Vec<(i64, Balance)> = {
        let mut stmt = conn.prepare(
            "SELECT block, value FROM balance WHERE account = ?1 AND block <= ?2 ORDER BY block",
        )?;
        let mut rows = stmt.query(params![account, block])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(1)?;
            out.push((
                row.get(0)?,
                Balance::from_slice(&bytes).ok_or_else(|| {
                    ArchiveError::Corruption("malformed balance value".into())
                })?,
            ));
        }
        out
    };

    let nonce_rows: Vec<(i64, Nonce)> = {
        let mut stmt = conn.prepare(
            "SELECT block, value FROM nonce WHERE account = ?1 AND block <= ?2 ORDER BY block",
        )?;
        let mut rows = stmt.query(params![account, block])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(1)?;
            out.push((
                row.get(0)?,
                Nonce::from_slice(&bytes)
                    .ok_or_else(|| ArchiveError::Corruption("malformed nonce value".into()))?,
            ));
        }
        out
    };

    let code_rows: Vec<(i64, Vec<u8>)> = {
        let mut stmt = conn.prepare(
            "SELECT block, code FROM code WHERE account = ?1 AND block <= ?2 ORDER BY block",
        )?;
        let mut rows = stmt.query(params![account, block])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        out
    };

    let storage_rows: Vec<(i64, Key, Value)> = {
        let mut stmt = conn.prepare(
            "SELECT block, slot, value FROM storage WHERE account = ?1 AND block <= ?2 \
             ORDER BY block, slot",
        )?;
        let mut rows = stmt.query(params![account, block])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let slot: Vec<u8> = row.get(1)?;
            let value: Vec<u8> = row.get(2)?;
            out.push((
                row.get(0)?,
                Key::from_slice(&slot)
                    .ok_or_else(|| ArchiveError::Corruption("malformed slot key".into()))?,
                Value::from_slice(&value)
                    .ok_or_else(|| ArchiveError::Corruption("malformed slot value".into()))?,
            ));
        }
        out
    };

    // Collect every block the content tables touch, in order.
    let mut blocks: Vec<i64> = status_rows
        .iter()
        .map(|(b, _)| *b)
        .chain(balance_rows.iter().map(|(b, _)| *b))
        .chain(nonce_rows.iter().map(|(b, _)| *b))
        .chain(code_rows.iter().map(|(b, _)| *b))
        .chain(storage_rows.iter().map(|(b, _, _)| *b))
        .collect();
    blocks.sort_unstable();
    blocks.dedup();

    if blocks.len() != hash_rows.len() {
        return Err(ArchiveError::Corruption(format!(
            "account {addr} has {} content blocks but {} hashes",
            blocks.len(),
            hash_rows.len()
        )));
    }

    let mut hash = Hash::ZERO;
    for (current, (hash_block, stored_hash)) in blocks.iter().zip(&hash_rows) {
        if current != hash_block {
            return Err(ArchiveError::Corruption(format!(
                "archive contains update for block {current} but no hash for it"
            )));
        }

        let mut account_update = AccountUpdate {
            address: *addr,
            ..AccountUpdate::default()
        };
        for (_, exist) in status_rows.iter().filter(|(b, _)| b == current) {
            if *exist {
                account_update.created = true;
            } else {
                account_update.deleted = true;
            }
        }
        if let Some((_, balance)) = balance_rows.iter().find(|(b, _)| b == current) {
            account_update.balance = Some(*balance);
        }
        if let Some((_, nonce)) = nonce_rows.iter().find(|(b, _)| b == current) {
            account_update.nonce = Some(*nonce);
        }
        if let Some((_, code)) = code_rows.iter().find(|(b, _)| b == current) {
            account_update.code = Some(code.clone());
        }
        for (_, key, value) in storage_rows.iter().filter(|(b, _, _)| b == current) {
            account_update.storage.push((*key, *value));
        }

        hash = chain_hash(&hash, &account_update.diff_hash());
        if hash != *stored_hash {
            return Err(ArchiveError::Corruption(format!(
                "hash for account {addr} at block {current} does not match"
            )));
        }
    }
    Ok(())
}
