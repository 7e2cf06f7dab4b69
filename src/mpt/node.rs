//! Trie node model.
//!
//! Every node is persisted in the stock of its variant under a `NodeId`
//! combining a variant tag with a 56-bit stock index. Parents embed the
//! hashes of their children together with per-child dirty bits, so hashing
//! can skip clean subtrees without loading them.
//!
//! Frozen flags are not persisted: a forest in immutable mode treats every
//! node loaded from disk as frozen and path-copies on write.

use tiny_keccak::{Hasher as _, Keccak};

use crate::common::{AccountInfo, Address, Hash, Key, Value};
use crate::store::{Record, Result as StoreResult, StoreError};

use super::nibbles::NibblePath;

/// Computes the Keccak-256 hash of data.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    Hash(out)
}

/// Root hash of the empty Ethereum trie: `keccak256(rlp(""))`.
pub const EMPTY_TRIE_ROOT: Hash = Hash([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

/// Keccak-256 of the empty byte string (the code hash of a fresh account).
pub const EMPTY_CODE_HASH: Hash = Hash([
    0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7, 0x03,
    0xc0, 0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04, 0x5d, 0x85,
    0xa4, 0x70,
]);

/// The node variant encoded in a [`NodeId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Empty = 0,
    Branch = 1,
    Extension = 2,
    Account = 3,
    Value = 4,
}

/// Identifier of a persisted node: a variant tag plus a stock index.
///
/// The all-zero id is the empty sentinel; it is never dereferenced and
/// never stored in a stock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId(u64);

impl NodeId {
    /// The empty sentinel.
    pub const EMPTY: NodeId = NodeId(0);

    const INDEX_BITS: u32 = 56;
    const INDEX_MASK: u64 = (1 << Self::INDEX_BITS) - 1;

    pub fn branch(index: u64) -> Self {
        Self::tagged(NodeKind::Branch, index)
    }

    pub fn extension(index: u64) -> Self {
        Self::tagged(NodeKind::Extension, index)
    }

    pub fn account(index: u64) -> Self {
        Self::tagged(NodeKind::Account, index)
    }

    pub fn value(index: u64) -> Self {
        Self::tagged(NodeKind::Value, index)
    }

    fn tagged(kind: NodeKind, index: u64) -> Self {
        debug_assert!(index <= Self::INDEX_MASK, "stock index overflow");
        NodeId((kind as u64) << Self::INDEX_BITS | index)
    }

    /// Returns the variant of the referenced node.
    pub fn kind(&self) -> NodeKind {
        match self.0 >> Self::INDEX_BITS {
            0 => NodeKind::Empty,
            1 => NodeKind::Branch,
            2 => NodeKind::Extension,
            3 => NodeKind::Account,
            4 => NodeKind::Value,
            // Only reachable through `from_raw`, which validates.
            _ => unreachable!("invalid node id tag"),
        }
    }

    /// Returns the index into the variant's stock.
    pub fn index(&self) -> u64 {
        self.0 & Self::INDEX_MASK
    }

    /// Returns true if this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the raw persisted form.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Validates and restores an id from its persisted form.
    pub fn from_raw(raw: u64) -> StoreResult<Self> {
        let tag = raw >> Self::INDEX_BITS;
        if tag > NodeKind::Value as u64 || (tag == 0 && raw != 0) {
            return Err(StoreError::Corruption(format!(
                "invalid node id 0x{raw:016x}"
            )));
        }
        Ok(NodeId(raw))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "NodeId(empty)")
        } else {
            write!(f, "NodeId({:?}/{})", self.kind(), self.index())
        }
    }
}

/// A branch node: one child per nibble.
///
/// `dirty_hashes` marks children whose embedded hash is stale;
/// `embedded` marks children whose RLP encoding is shorter than 32 bytes
/// and therefore inlined into this node's encoding under the Ethereum hash
/// scheme. `frozen` and `frozen_children` exist only in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchNode {
    pub children: [NodeId; 16],
    pub hashes: [Hash; 16],
    pub dirty_hashes: u16,
    pub embedded: u16,
    pub frozen: bool,
    pub frozen_children: u16,
}

impl BranchNode {
    pub fn new() -> Self {
        Self {
            children: [NodeId::EMPTY; 16],
            hashes: [Hash::ZERO; 16],
            dirty_hashes: 0,
            embedded: 0,
            frozen: false,
            frozen_children: 0,
        }
    }

    /// Number of non-empty children.
    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// Marks the hash of the child at `nibble` stale.
    pub fn mark_dirty(&mut self, nibble: u8) {
        self.dirty_hashes |= 1 << nibble;
    }

    pub fn is_dirty(&self, nibble: u8) -> bool {
        self.dirty_hashes & (1 << nibble) != 0
    }

    pub fn is_embedded(&self, nibble: u8) -> bool {
        self.embedded & (1 << nibble) != 0
    }

    pub fn set_embedded(&mut self, nibble: u8, embedded: bool) {
        if embedded {
            self.embedded |= 1 << nibble;
        } else {
            self.embedded &= !(1 << nibble);
        }
    }
}

impl Default for BranchNode {
    fn default() -> Self {
        Self::new()
    }
}

/// An extension node: a shared nibble sub-path in front of a branch.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionNode {
    pub path: NibblePath,
    pub next: NodeId,
    pub next_hash: Hash,
    pub next_hash_dirty: bool,
    pub next_embedded: bool,
    pub frozen: bool,
}

impl ExtensionNode {
    pub fn new(path: NibblePath, next: NodeId) -> Self {
        Self {
            path,
            next,
            next_hash: Hash::ZERO,
            next_hash_dirty: true,
            next_embedded: false,
            frozen: false,
        }
    }
}

/// An account leaf: account data plus the root of its storage trie.
#[derive(Clone, Debug, PartialEq)]
pub struct AccountNode {
    pub address: Address,
    pub info: AccountInfo,
    pub storage: NodeId,
    pub storage_hash: Hash,
    pub storage_hash_dirty: bool,
    pub frozen: bool,
}

impl AccountNode {
    pub fn new(address: Address, info: AccountInfo) -> Self {
        Self {
            address,
            info,
            storage: NodeId::EMPTY,
            storage_hash: Hash::ZERO,
            storage_hash_dirty: true,
            frozen: false,
        }
    }
}

/// A storage slot leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueNode {
    pub key: Key,
    pub value: Value,
    pub frozen: bool,
}

impl ValueNode {
    pub fn new(key: Key, value: Value) -> Self {
        Self {
            key,
            value,
            frozen: false,
        }
    }
}

/// A resolved node of any variant.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Branch(BranchNode),
    Extension(ExtensionNode),
    Account(AccountNode),
    Value(ValueNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Branch(_) => NodeKind::Branch,
            Node::Extension(_) => NodeKind::Extension,
            Node::Account(_) => NodeKind::Account,
            Node::Value(_) => NodeKind::Value,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            Node::Branch(n) => n.frozen,
            Node::Extension(n) => n.frozen,
            Node::Account(n) => n.frozen,
            Node::Value(n) => n.frozen,
        }
    }

    /// Marks the node frozen; a frozen branch knows all children frozen.
    pub fn set_frozen(&mut self) {
        match self {
            Node::Branch(n) => {
                n.frozen = true;
                n.frozen_children = 0xFFFF;
            }
            Node::Extension(n) => n.frozen = true,
            Node::Account(n) => n.frozen = true,
            Node::Value(n) => n.frozen = true,
        }
    }
}

// Record layouts. All integers little-endian; reserved bytes are zero.

fn read_u64(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[..8].try_into().unwrap())
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes(data[..2].try_into().unwrap())
}

fn read_hash(data: &[u8]) -> Hash {
    Hash(data[..32].try_into().unwrap())
}

impl Record for BranchNode {
    // 16 child ids, 16 child hashes, dirty mask, embedded mask, 2 reserved.
    const ENCODED_SIZE: usize = 16 * 8 + 16 * 32 + 2 + 2 + 2;

    fn encode(&self, out: &mut [u8]) {
        for (i, child) in self.children.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&child.to_raw().to_le_bytes());
        }
        let mut offset = 128;
        for hash in &self.hashes {
            out[offset..offset + 32].copy_from_slice(hash.as_bytes());
            offset += 32;
        }
        out[offset..offset + 2].copy_from_slice(&self.dirty_hashes.to_le_bytes());
        out[offset + 2..offset + 4].copy_from_slice(&self.embedded.to_le_bytes());
        out[offset + 4..offset + 6].fill(0);
    }

    fn decode(data: &[u8]) -> StoreResult<Self> {
        let mut node = BranchNode::new();
        for i in 0..16 {
            node.children[i] = NodeId::from_raw(read_u64(&data[i * 8..]))?;
        }
        let mut offset = 128;
        for i in 0..16 {
            node.hashes[i] = read_hash(&data[offset..]);
            offset += 32;
        }
        node.dirty_hashes = read_u16(&data[offset..]);
        node.embedded = read_u16(&data[offset + 2..]);
        Ok(node)
    }
}

impl Record for ExtensionNode {
    // Path length, packed path, child id, child hash, flags.
    const ENCODED_SIZE: usize = 1 + 32 + 8 + 32 + 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.path.len() as u8;
        out[1..33].copy_from_slice(&self.path.pack());
        out[33..41].copy_from_slice(&self.next.to_raw().to_le_bytes());
        out[41..73].copy_from_slice(self.next_hash.as_bytes());
        out[73] = self.next_hash_dirty as u8 | (self.next_embedded as u8) << 1;
    }

    fn decode(data: &[u8]) -> StoreResult<Self> {
        let len = data[0] as usize;
        if len == 0 || len > 64 {
            return Err(StoreError::Corruption(format!(
                "invalid extension path length {len}"
            )));
        }
        let packed: [u8; 32] = data[1..33].try_into().unwrap();
        Ok(Self {
            path: NibblePath::unpack(&packed, len),
            next: NodeId::from_raw(read_u64(&data[33..]))?,
            next_hash: read_hash(&data[41..]),
            next_hash_dirty: data[73] & 1 != 0,
            next_embedded: data[73] & 2 != 0,
            frozen: false,
        })
    }
}

impl Record for AccountNode {
    // Address, account info, storage root id, storage hash, flags.
    const ENCODED_SIZE: usize = 20 + AccountInfo::ENCODED_SIZE + 8 + 32 + 1;

    fn encode(&self, out: &mut [u8]) {
        out[..20].copy_from_slice(self.address.as_bytes());
        self.info.encode(&mut out[20..76]);
        out[76..84].copy_from_slice(&self.storage.to_raw().to_le_bytes());
        out[84..116].copy_from_slice(self.storage_hash.as_bytes());
        out[116] = self.storage_hash_dirty as u8;
    }

    fn decode(data: &[u8]) -> StoreResult<Self> {
        Ok(Self {
            address: Address(data[..20].try_into().unwrap()),
            info: AccountInfo::decode(&data[20..76]),
            storage: NodeId::from_raw(read_u64(&data[76..]))?,
            storage_hash: read_hash(&data[84..]),
            storage_hash_dirty: data[116] & 1 != 0,
            frozen: false,
        })
    }
}

impl Record for ValueNode {
    const ENCODED_SIZE: usize = 32 + 32;

    fn encode(&self, out: &mut [u8]) {
        out[..32].copy_from_slice(self.key.as_bytes());
        out[32..64].copy_from_slice(self.value.as_bytes());
    }

    fn decode(data: &[u8]) -> StoreResult<Self> {
        Ok(Self {
            key: Key(data[..32].try_into().unwrap()),
            value: Value(data[32..64].try_into().unwrap()),
            frozen: false,
        })
    }
}
