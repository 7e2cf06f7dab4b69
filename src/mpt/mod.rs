//! The Merkle Patricia Trie storage core.
//!
//! A [`Forest`] owns the node stocks and caches and exposes multi-root trie
//! operations; [`LiveTrie`] narrows that to a single root, and [`MptState`]
//! adds the contract-code store and the account-centric state contract.

mod cache;
mod forest;
mod hasher;
mod live_trie;
mod lock;
mod nibbles;
mod node;
mod rlp;
mod state;

pub use cache::{NodeEntry, NodeHandle, NodeReadGuard, NodeWriteGuard};
pub use forest::{Forest, ForestConfig, ForestMode};
pub use hasher::HashScheme;
pub use live_trie::LiveTrie;
pub use lock::DirectoryLock;
pub use nibbles::NibblePath;
pub use node::{
    keccak256, AccountNode, BranchNode, ExtensionNode, Node, NodeId, NodeKind, ValueNode,
    EMPTY_CODE_HASH, EMPTY_TRIE_ROOT,
};
pub use rlp::RlpEncoder;
pub use state::MptState;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// Hashing configuration of a forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MptConfig {
    pub hashing: HashScheme,
}

impl Default for MptConfig {
    fn default() -> Self {
        Self {
            hashing: HashScheme::Ethereum,
        }
    }
}

/// Trie layer errors.
#[derive(Error, Debug)]
pub enum MptError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupted trie: {0}")]
    Corruption(String),
    #[error("forest is closed")]
    Closed,
    #[error("state directory {path} is locked by another process")]
    LockContention { path: PathBuf },
    #[error("corrupted code file {path}")]
    CorruptedCodeFile { path: PathBuf },
    #[error("empty node id dereferenced")]
    EmptyNodeAccess,
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("{}", format_error_list(.0))]
    Aggregate(Vec<MptError>),
}

fn format_error_list(errors: &[MptError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl MptError {
    /// Attaches the failing path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        MptError::Io {
            path: path.into(),
            source,
        }
    }

    /// Combines the errors of several independent shutdown steps.
    ///
    /// Returns `Ok` when no step failed, the error itself when exactly one
    /// failed, and an aggregate surfacing all of them otherwise.
    pub fn join(mut errors: Vec<MptError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(MptError::Aggregate(errors)),
        }
    }
}

/// Result type for trie operations.
pub type Result<T> = std::result::Result<T, MptError>;
