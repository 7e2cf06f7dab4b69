//! Ethereum compatibility tests.
//!
//! RLP encodings are checked against vectors from the ethereum/tests RLP
//! suite; hashing constants against well-known Keccak-256 digests; and the
//! forest's Ethereum hash scheme against independently constructed node
//! encodings.

use forest_db::common::{AccountInfo, Address, Balance, Hash, Key, Nonce, Value};
use forest_db::mpt::{
    keccak256, Forest, ForestConfig, ForestMode, HashScheme, MptConfig, NibblePath, NodeId,
    RlpEncoder, EMPTY_CODE_HASH, EMPTY_TRIE_ROOT,
};
use hex_literal::hex;

fn ethereum_forest() -> Forest {
    Forest::open_in_memory(
        MptConfig {
            hashing: HashScheme::Ethereum,
        },
        ForestConfig {
            mode: ForestMode::Mutable,
            cache_capacity: 1024,
        },
    )
    .unwrap()
}

mod rlp_vectors {
    use super::*;

    #[test]
    fn test_empty_string() {
        let mut enc = RlpEncoder::new();
        enc.encode_bytes(&[]);
        assert_eq!(enc.as_bytes(), &[0x80]);
    }

    #[test]
    fn test_dog() {
        let mut enc = RlpEncoder::new();
        enc.encode_bytes(b"dog");
        assert_eq!(enc.as_bytes(), hex!("83646f67").as_slice());
    }

    #[test]
    fn test_single_byte_low() {
        // A single byte below 0x80 encodes as itself.
        let mut enc = RlpEncoder::new();
        enc.encode_bytes(&[0x00]);
        assert_eq!(enc.as_bytes(), &[0x00]);
    }

    #[test]
    fn test_cat_dog_list() {
        let mut enc = RlpEncoder::new();
        enc.encode_list(|e| {
            e.encode_bytes(b"cat");
            e.encode_bytes(b"dog");
        });
        assert_eq!(enc.as_bytes(), hex!("c88363617483646f67").as_slice());
    }

    #[test]
    fn test_nested_empty_lists() {
        // [ [], [[]], [ [], [[]] ] ]
        let mut enc = RlpEncoder::new();
        enc.encode_list(|e| {
            e.encode_list(|_| {});
            e.encode_list(|e| e.encode_list(|_| {}));
            e.encode_list(|e| {
                e.encode_list(|_| {});
                e.encode_list(|e| e.encode_list(|_| {}));
            });
        });
        assert_eq!(enc.as_bytes(), hex!("c7c0c1c0c3c0c1c0").as_slice());
    }

    #[test]
    fn test_integers() {
        let mut enc = RlpEncoder::new();
        enc.encode_u64(0);
        assert_eq!(enc.as_bytes(), &[0x80]);

        let mut enc = RlpEncoder::new();
        enc.encode_u64(15);
        assert_eq!(enc.as_bytes(), &[0x0f]);

        let mut enc = RlpEncoder::new();
        enc.encode_u64(1024);
        assert_eq!(enc.as_bytes(), hex!("820400").as_slice());
    }
}

mod keccak_vectors {
    use super::*;

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            keccak256(&[]),
            Hash(hex!(
                "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
            ))
        );
        assert_eq!(keccak256(&[]), EMPTY_CODE_HASH);
    }

    #[test]
    fn test_keccak_of_empty_rlp_is_empty_trie_root() {
        assert_eq!(
            keccak256(&[0x80]),
            Hash(hex!(
                "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
            ))
        );
        assert_eq!(keccak256(&[0x80]), EMPTY_TRIE_ROOT);
    }

    #[test]
    fn test_keccak_hello() {
        assert_eq!(
            keccak256(b"hello"),
            Hash(hex!(
                "1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
            ))
        );
    }

    #[test]
    fn test_keccak_address_one() {
        let addr = hex!("0000000000000000000000000000000000000001");
        assert_eq!(
            keccak256(&addr),
            Hash(hex!(
                "1468288056310c82aa4c01a7e12a10f8111a0560e72b700555479031b86c357d"
            ))
        );
    }
}

#[test]
fn test_empty_trie_root() {
    let forest = ethereum_forest();
    assert_eq!(
        forest.update_hashes_for(NodeId::EMPTY).unwrap(),
        EMPTY_TRIE_ROOT
    );
}

#[test]
fn test_single_account_root_matches_reference_encoding() {
    // A trie with one account is a single leaf; its root hash is the
    // keccak of the leaf's RLP, built here without the forest.
    let forest = ethereum_forest();
    let addr = Address(hex!("0000000000000000000000000000000000000001"));
    let info = AccountInfo {
        nonce: Nonce::from_u64(1),
        balance: Balance::from_u64(1000),
        code_hash: EMPTY_CODE_HASH,
    };
    let root = forest.set_account_info(NodeId::EMPTY, &addr, &info).unwrap();
    let got = forest.update_hashes_for(root).unwrap();

    let path = NibblePath::from_hash(&keccak256(addr.as_bytes()));
    let mut account_rlp = RlpEncoder::new();
    account_rlp.encode_list(|e| {
        e.encode_uint(info.nonce.as_bytes());
        e.encode_uint(info.balance.as_bytes());
        e.encode_bytes(EMPTY_TRIE_ROOT.as_bytes());
        e.encode_bytes(info.code_hash.as_bytes());
    });
    let mut leaf_rlp = RlpEncoder::new();
    leaf_rlp.encode_list(|e| {
        e.encode_nibbles(path.as_slice(), true);
        e.encode_bytes(account_rlp.as_bytes());
    });

    assert_eq!(got, keccak256(leaf_rlp.as_bytes()));
}

#[test]
fn test_storage_root_matches_reference_encoding() {
    let forest = ethereum_forest();
    let addr = Address(hex!("0000000000000000000000000000000000000001"));
    let info = AccountInfo {
        nonce: Nonce::from_u64(1),
        balance: Balance::ZERO,
        code_hash: EMPTY_CODE_HASH,
    };
    let slot = Key([0x11; 32]);
    let mut value = Value::ZERO;
    value.0[31] = 0x2A;

    let root = forest.set_account_info(NodeId::EMPTY, &addr, &info).unwrap();
    let root = forest.set_value(root, &addr, &slot, &value).unwrap();
    let got = forest.update_hashes_for(root).unwrap();

    // The storage trie is a single value leaf.
    let slot_path = NibblePath::from_hash(&keccak256(slot.as_bytes()));
    let mut value_rlp = RlpEncoder::new();
    value_rlp.encode_uint(value.as_bytes());
    let mut slot_leaf = RlpEncoder::new();
    slot_leaf.encode_list(|e| {
        e.encode_nibbles(slot_path.as_slice(), true);
        e.encode_bytes(value_rlp.as_bytes());
    });
    let storage_root = keccak256(slot_leaf.as_bytes());

    // The account trie is a single account leaf referencing it.
    let path = NibblePath::from_hash(&keccak256(addr.as_bytes()));
    let mut account_rlp = RlpEncoder::new();
    account_rlp.encode_list(|e| {
        e.encode_uint(info.nonce.as_bytes());
        e.encode_uint(info.balance.as_bytes());
        e.encode_bytes(storage_root.as_bytes());
        e.encode_bytes(info.code_hash.as_bytes());
    });
    let mut leaf_rlp = RlpEncoder::new();
    leaf_rlp.encode_list(|e| {
        e.encode_nibbles(path.as_slice(), true);
        e.encode_bytes(account_rlp.as_bytes());
    });

    assert_eq!(got, keccak256(leaf_rlp.as_bytes()));
}

#[test]
fn test_root_is_insertion_order_independent() {
    let forward = ethereum_forest();
    let backward = ethereum_forest();
    let info = |n: u64| AccountInfo {
        nonce: Nonce::from_u64(n),
        code_hash: EMPTY_CODE_HASH,
        ..AccountInfo::default()
    };

    let mut root_a = NodeId::EMPTY;
    let mut root_b = NodeId::EMPTY;
    for i in 0..32u8 {
        let mut bytes = [0u8; 20];
        bytes[19] = i;
        root_a = forward
            .set_account_info(root_a, &Address(bytes), &info(i as u64 + 1))
            .unwrap();
    }
    for i in (0..32u8).rev() {
        let mut bytes = [0u8; 20];
        bytes[19] = i;
        root_b = backward
            .set_account_info(root_b, &Address(bytes), &info(i as u64 + 1))
            .unwrap();
    }

    assert_eq!(
        forward.update_hashes_for(root_a).unwrap(),
        backward.update_hashes_for(root_b).unwrap()
    );
}

#[test]
fn test_root_is_history_independent() {
    // Inserting and deleting again leaves the root hash of the remaining
    // state unchanged.
    let pristine = ethereum_forest();
    let churned = ethereum_forest();
    let info = |n: u64| AccountInfo {
        nonce: Nonce::from_u64(n),
        code_hash: EMPTY_CODE_HASH,
        ..AccountInfo::default()
    };
    let addr = |b: u8| {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        Address(bytes)
    };

    let mut root_a = NodeId::EMPTY;
    for i in 0..8u8 {
        root_a = pristine
            .set_account_info(root_a, &addr(i), &info(i as u64 + 1))
            .unwrap();
    }

    let mut root_b = NodeId::EMPTY;
    for i in 0..16u8 {
        root_b = churned
            .set_account_info(root_b, &addr(i), &info(i as u64 + 1))
            .unwrap();
    }
    for i in 8..16u8 {
        root_b = churned
            .set_account_info(root_b, &addr(i), &AccountInfo::default())
            .unwrap();
    }

    assert_eq!(
        pristine.update_hashes_for(root_a).unwrap(),
        churned.update_hashes_for(root_b).unwrap()
    );
}

#[test]
fn test_same_updates_twice_give_equal_roots() {
    // Applying one update sequence to two fresh forests ends in identical
    // root hashes.
    let build = || {
        let forest = ethereum_forest();
        let mut root = NodeId::EMPTY;
        for i in 0..16u8 {
            let mut bytes = [0u8; 20];
            bytes[10] = i;
            let addr = Address(bytes);
            let info = AccountInfo {
                nonce: Nonce::from_u64(i as u64 + 1),
                balance: Balance::from_u64(i as u64 * 10),
                code_hash: EMPTY_CODE_HASH,
            };
            root = forest.set_account_info(root, &addr, &info).unwrap();
            let mut slot = [0u8; 32];
            slot[0] = i;
            let mut val = [0u8; 32];
            val[31] = i + 1;
            root = forest
                .set_value(root, &addr, &Key(slot), &Value(val))
                .unwrap();
        }
        forest.update_hashes_for(root).unwrap()
    };
    assert_eq!(build(), build());
}
