//! Fixed-size transaction hash type.

use std::fmt;

/// Transaction hash length in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte transaction hash.
///
/// The execution core never computes hashes; it receives them as opaque
/// job input and copies them into VM memory, so this is a plain carrier
/// type. `Copy` keeps the frequent handoffs on the stack.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct TxHash(pub [u8; HASH_LEN]);

impl TxHash {
    /// Creates a zero-valued hash (all bytes 0x00).
    pub const fn zero() -> TxHash {
        TxHash([0u8; HASH_LEN])
    }

    /// Returns the hash as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a hash from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`HASH_LEN`].
    pub fn from_slice(slice: &[u8]) -> Option<TxHash> {
        if slice.len() != HASH_LEN {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(slice);
        Some(TxHash(bytes))
    }

    /// Parses a hash from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<TxHash> {
        TxHash::from_slice(&hex::decode(s).ok()?)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
