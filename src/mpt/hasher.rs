//! Node hashing.
//!
//! Hashes are maintained lazily: writes only flag stale hashes, and
//! `update_hashes_for` walks the dirty part of a trie bottom-up, fills the
//! recomputed hashes into the parents and clears the dirty bits. Children
//! of a branch are hashed in parallel.
//!
//! Two schemes are supported: a fast internal serialization and the
//! Ethereum-compatible MPT encoding, where nodes whose RLP is shorter than
//! 32 bytes are embedded into their parent instead of being referenced by
//! hash.

use rayon::prelude::*;

use crate::common::Hash;

use super::forest::Forest;
use super::nibbles::NibblePath;
use super::node::{keccak256, Node, NodeId, EMPTY_TRIE_ROOT};
use super::rlp::RlpEncoder;
use super::Result;

/// The hashing scheme of a forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashScheme {
    /// Keccak-256 over a compact tag-prefixed node serialization.
    Direct,
    /// Bit-compatible with the Ethereum MPT (RLP node encodings).
    Ethereum,
}

impl HashScheme {
    /// The hash of the empty trie.
    pub fn empty_hash(&self) -> Hash {
        match self {
            HashScheme::Direct => Hash::ZERO,
            HashScheme::Ethereum => EMPTY_TRIE_ROOT,
        }
    }
}

/// The outcome of hashing one node.
struct NodeDigest {
    hash: Hash,
    /// Set when the node's RLP is embedded into the parent instead of
    /// referenced by hash (Ethereum scheme, non-root nodes under 32 bytes).
    embedded: bool,
}

impl Forest {
    /// Recomputes all stale hashes under `root` and returns the root hash.
    ///
    /// Serialized with structural writers; concurrent readers of the same
    /// root are unaffected. Once this returns, the root hash is stable
    /// until the next write reaching `root`.
    pub fn update_hashes_for(&self, root: NodeId) -> Result<Hash> {
        let _forest = self.forest_lock.read();
        let _write = self.write_lock.lock();
        self.check_open()?;
        Ok(self.node_digest(root, 0)?.hash)
    }

    /// The hash of an empty trie under the configured scheme.
    pub fn empty_root_hash(&self) -> Hash {
        self.config.hashing.empty_hash()
    }

    /// Hashes a node, refreshing stale descendant hashes first.
    fn node_digest(&self, id: NodeId, depth: usize) -> Result<NodeDigest> {
        if id.is_empty() {
            return Ok(NodeDigest {
                hash: self.config.hashing.empty_hash(),
                embedded: false,
            });
        }
        self.refresh_child_hashes(id, depth)?;

        let guard = self.read_node(id)?;
        match self.config.hashing {
            HashScheme::Direct => Ok(NodeDigest {
                hash: keccak256(&direct_node_bytes(&guard.node)),
                embedded: false,
            }),
            HashScheme::Ethereum => {
                let rlp = self.node_rlp(&guard.node, depth)?;
                Ok(NodeDigest {
                    hash: keccak256(&rlp),
                    // Trie roots are always referenced by hash.
                    embedded: depth > 0 && rlp.len() < 32,
                })
            }
        }
    }

    /// Brings the embedded child hashes of `id` up to date.
    fn refresh_child_hashes(&self, id: NodeId, depth: usize) -> Result<()> {
        enum Work {
            None,
            Branch(Vec<(u8, NodeId)>),
            Extension(NodeId, usize),
            Account(NodeId),
        }

        let work = {
            let guard = self.read_node(id)?;
            match &guard.node {
                Node::Branch(b) => {
                    let dirty: Vec<(u8, NodeId)> = (0u8..16)
                        .filter(|&n| b.is_dirty(n))
                        .map(|n| (n, b.children[n as usize]))
                        .collect();
                    if dirty.is_empty() {
                        Work::None
                    } else {
                        Work::Branch(dirty)
                    }
                }
                Node::Extension(e) => {
                    if e.next_hash_dirty {
                        Work::Extension(e.next, e.path.len())
                    } else {
                        Work::None
                    }
                }
                Node::Account(a) => {
                    if a.storage_hash_dirty {
                        Work::Account(a.storage)
                    } else {
                        Work::None
                    }
                }
                Node::Value(_) => Work::None,
            }
        };

        match work {
            Work::None => Ok(()),
            Work::Branch(dirty) => {
                let digests: Vec<(u8, NodeDigest)> = if dirty.len() > 1 {
                    dirty
                        .par_iter()
                        .map(|&(n, child)| self.node_digest(child, depth + 1).map(|d| (n, d)))
                        .collect::<Result<_>>()?
                } else {
                    let (n, child) = dirty[0];
                    vec![(n, self.node_digest(child, depth + 1)?)]
                };
                let mut guard = self.write_node_for_hashing(id)?;
                if let Node::Branch(b) = &mut guard.node {
                    for (nibble, digest) in digests {
                        b.hashes[nibble as usize] = digest.hash;
                        b.set_embedded(nibble, digest.embedded);
                        b.dirty_hashes &= !(1 << nibble);
                    }
                }
                guard.dirty = true;
                Ok(())
            }
            Work::Extension(next, path_len) => {
                let digest = self.node_digest(next, depth + path_len)?;
                let mut guard = self.write_node_for_hashing(id)?;
                if let Node::Extension(e) = &mut guard.node {
                    e.next_hash = digest.hash;
                    e.next_embedded = digest.embedded;
                    e.next_hash_dirty = false;
                }
                guard.dirty = true;
                Ok(())
            }
            Work::Account(storage) => {
                // Storage tries restart at depth zero; their root is always
                // referenced by hash.
                let digest = self.node_digest(storage, 0)?;
                let mut guard = self.write_node_for_hashing(id)?;
                if let Node::Account(a) = &mut guard.node {
                    a.storage_hash = digest.hash;
                    a.storage_hash_dirty = false;
                }
                guard.dirty = true;
                Ok(())
            }
        }
    }

    /// Recomputes the hash of a node without touching any dirty flags.
    ///
    /// Returns `None` when the node carries stale child hashes, in which
    /// case its own hash cannot be validated. Used by structural checks.
    pub(crate) fn readonly_node_hash(&self, id: NodeId, depth: usize) -> Result<Option<Hash>> {
        if id.is_empty() {
            return Ok(Some(self.config.hashing.empty_hash()));
        }
        let guard = self.read_node(id)?;
        let clean = match &guard.node {
            Node::Branch(b) => b.dirty_hashes == 0,
            Node::Extension(e) => !e.next_hash_dirty,
            Node::Account(a) => !a.storage_hash_dirty,
            Node::Value(_) => true,
        };
        if !clean {
            return Ok(None);
        }
        let hash = match self.config.hashing {
            HashScheme::Direct => keccak256(&direct_node_bytes(&guard.node)),
            HashScheme::Ethereum => keccak256(&self.node_rlp(&guard.node, depth)?),
        };
        Ok(Some(hash))
    }

    /// The Ethereum RLP encoding of a node at the given depth.
    ///
    /// Children flagged as embedded are re-encoded inline; their hashes are
    /// clean whenever this is called (the dirty walk runs bottom-up).
    pub(crate) fn node_rlp(&self, node: &Node, depth: usize) -> Result<Vec<u8>> {
        enum ChildRepr {
            Empty,
            ByHash(Hash),
            Inline(Vec<u8>),
        }

        let mut enc = RlpEncoder::with_capacity(128);
        match node {
            Node::Branch(b) => {
                let mut reprs = Vec::with_capacity(16);
                for nibble in 0u8..16 {
                    let child = b.children[nibble as usize];
                    if child.is_empty() {
                        reprs.push(ChildRepr::Empty);
                    } else if b.is_embedded(nibble) {
                        let child_guard = self.read_node(child)?;
                        reprs.push(ChildRepr::Inline(
                            self.node_rlp(&child_guard.node, depth + 1)?,
                        ));
                    } else {
                        reprs.push(ChildRepr::ByHash(b.hashes[nibble as usize]));
                    }
                }
                enc.encode_list(|e| {
                    for repr in &reprs {
                        match repr {
                            ChildRepr::Empty => e.encode_empty(),
                            ChildRepr::ByHash(hash) => e.encode_bytes(hash.as_bytes()),
                            ChildRepr::Inline(rlp) => e.encode_raw(rlp),
                        }
                    }
                    // Branches of secured tries never carry a value.
                    e.encode_empty();
                });
            }
            Node::Extension(ext) => {
                let inline = if ext.next_embedded {
                    let child_guard = self.read_node(ext.next)?;
                    Some(self.node_rlp(&child_guard.node, depth + ext.path.len())?)
                } else {
                    None
                };
                enc.encode_list(|e| {
                    e.encode_nibbles(ext.path.as_slice(), false);
                    match &inline {
                        Some(rlp) => e.encode_raw(rlp),
                        None => e.encode_bytes(ext.next_hash.as_bytes()),
                    }
                });
            }
            Node::Account(a) => {
                let full = NibblePath::from_hash(&self.address_hasher.hash(a.address));
                let mut inner = RlpEncoder::with_capacity(80);
                inner.encode_list(|e| {
                    e.encode_uint(a.info.nonce.as_bytes());
                    e.encode_uint(a.info.balance.as_bytes());
                    e.encode_bytes(a.storage_hash.as_bytes());
                    e.encode_bytes(a.info.code_hash.as_bytes());
                });
                enc.encode_list(|e| {
                    e.encode_nibbles(&full.as_slice()[depth..], true);
                    e.encode_bytes(inner.as_bytes());
                });
            }
            Node::Value(v) => {
                let full = NibblePath::from_hash(&self.key_hasher.hash(v.key));
                let mut inner = RlpEncoder::new();
                inner.encode_uint(v.value.as_bytes());
                enc.encode_list(|e| {
                    e.encode_nibbles(&full.as_slice()[depth..], true);
                    e.encode_bytes(inner.as_bytes());
                });
            }
        }
        Ok(enc.into_bytes())
    }
}

/// Serialization of the direct hashing scheme: a one-byte tag followed by
/// the node's fixed content and child hashes.
fn direct_node_bytes(node: &Node) -> Vec<u8> {
    match node {
        Node::Branch(b) => {
            let mut out = Vec::with_capacity(1 + 16 * 32);
            out.push(0x01);
            for hash in &b.hashes {
                out.extend_from_slice(hash.as_bytes());
            }
            out
        }
        Node::Extension(e) => {
            let mut out = Vec::with_capacity(2 + 32 + 32);
            out.push(0x02);
            out.push(e.path.len() as u8);
            out.extend_from_slice(&e.path.pack());
            out.extend_from_slice(e.next_hash.as_bytes());
            out
        }
        Node::Account(a) => {
            let mut out = Vec::with_capacity(1 + 20 + 16 + 8 + 32 + 32);
            out.push(0x03);
            out.extend_from_slice(a.address.as_bytes());
            out.extend_from_slice(a.info.balance.as_bytes());
            out.extend_from_slice(a.info.nonce.as_bytes());
            out.extend_from_slice(a.info.code_hash.as_bytes());
            out.extend_from_slice(a.storage_hash.as_bytes());
            out
        }
        Node::Value(v) => {
            let mut out = Vec::with_capacity(1 + 32 + 32);
            out.push(0x04);
            out.extend_from_slice(v.key.as_bytes());
            out.extend_from_slice(v.value.as_bytes());
            out
        }
    }
}
