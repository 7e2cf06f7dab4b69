//! Fixed-width value types used throughout the state engine.
//!
//! All types are plain byte arrays with a canonical encoding. Balances and
//! nonces are big-endian so their byte order matches their numeric order.

use std::fmt;

macro_rules! byte_type {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Width of the canonical encoding in bytes.
            pub const LEN: usize = $len;

            /// The all-zero value.
            pub const ZERO: Self = Self([0u8; $len]);

            /// Returns the canonical bytes.
            #[inline]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Returns true if every byte is zero.
            #[inline]
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|&b| b == 0)
            }

            /// Reconstructs the value from a byte slice.
            ///
            /// Returns `None` if the slice has the wrong length.
            pub fn from_slice(data: &[u8]) -> Option<Self> {
                let bytes: [u8; $len] = data.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x", stringify!($name))?;
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x")?;
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    };
}

byte_type!(
    /// A 20-byte account address.
    Address,
    20
);
byte_type!(
    /// A 32-byte storage slot key.
    Key,
    32
);
byte_type!(
    /// A 32-byte storage slot value. The zero value means "absent".
    Value,
    32
);
byte_type!(
    /// A 32-byte digest (Keccak-256 or SHA-256 depending on context).
    Hash,
    32
);
byte_type!(
    /// A 16-byte big-endian account balance.
    Balance,
    16
);
byte_type!(
    /// An 8-byte big-endian account nonce.
    Nonce,
    8
);

impl Balance {
    /// Builds a balance from a u64 amount.
    pub fn from_u64(amount: u64) -> Self {
        let mut bytes = [0u8; Self::LEN];
        bytes[Self::LEN - 8..].copy_from_slice(&amount.to_be_bytes());
        Self(bytes)
    }
}

impl Nonce {
    /// Builds a nonce from a u64 counter.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// Returns the nonce as a u64 counter.
    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

/// The information stored for a single account.
///
/// The all-zero info is the encoding of a non-existing account: writing it
/// through `set_account_info` removes the account from the trie.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AccountInfo {
    pub balance: Balance,
    pub nonce: Nonce,
    pub code_hash: Hash,
}

impl AccountInfo {
    /// Number of bytes in the canonical encoding.
    pub const ENCODED_SIZE: usize = Balance::LEN + Nonce::LEN + Hash::LEN;

    /// Returns true if this info describes a non-existing account.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.nonce.is_zero() && self.code_hash.is_zero()
    }

    /// Writes the canonical encoding (balance, nonce, code hash).
    pub fn encode(&self, out: &mut [u8]) {
        out[..Balance::LEN].copy_from_slice(self.balance.as_bytes());
        out[Balance::LEN..Balance::LEN + Nonce::LEN].copy_from_slice(self.nonce.as_bytes());
        out[Balance::LEN + Nonce::LEN..Self::ENCODED_SIZE]
            .copy_from_slice(self.code_hash.as_bytes());
    }

    /// Reads the canonical encoding written by [`AccountInfo::encode`].
    pub fn decode(data: &[u8]) -> Self {
        let mut info = AccountInfo::default();
        info.balance.0.copy_from_slice(&data[..Balance::LEN]);
        info.nonce
            .0
            .copy_from_slice(&data[Balance::LEN..Balance::LEN + Nonce::LEN]);
        info.code_hash
            .0
            .copy_from_slice(&data[Balance::LEN + Nonce::LEN..Self::ENCODED_SIZE]);
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values() {
        assert!(Address::ZERO.is_zero());
        assert!(Value::ZERO.is_zero());
        assert!(!Nonce::from_u64(1).is_zero());
    }

    #[test]
    fn test_nonce_round_trip() {
        for value in [0u64, 1, 255, 256, u64::MAX] {
            assert_eq!(Nonce::from_u64(value).to_u64(), value);
        }
    }

    #[test]
    fn test_balance_is_big_endian() {
        let balance = Balance::from_u64(0x0102);
        assert_eq!(balance.as_bytes()[14], 0x01);
        assert_eq!(balance.as_bytes()[15], 0x02);
    }

    #[test]
    fn test_balance_ordering_matches_numeric() {
        assert!(Balance::from_u64(5) < Balance::from_u64(7));
        assert!(Balance::from_u64(256) > Balance::from_u64(255));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(Address::from_slice(&[0u8; 19]).is_none());
        assert!(Address::from_slice(&[0u8; 20]).is_some());
    }

    #[test]
    fn test_account_info_round_trip() {
        let info = AccountInfo {
            balance: Balance::from_u64(100),
            nonce: Nonce::from_u64(42),
            code_hash: Hash([0xAB; 32]),
        };
        let mut buf = [0u8; AccountInfo::ENCODED_SIZE];
        info.encode(&mut buf);
        assert_eq!(AccountInfo::decode(&buf), info);
    }

    #[test]
    fn test_empty_account_info() {
        assert!(AccountInfo::default().is_empty());
        let info = AccountInfo {
            nonce: Nonce::from_u64(1),
            ..AccountInfo::default()
        };
        assert!(!info.is_empty());
    }
}
