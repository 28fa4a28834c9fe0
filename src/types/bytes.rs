//! Reference-counted byte buffer for script payloads.

use std::ops::Deref;
use std::sync::Arc;

/// A reference-counted, immutable byte buffer.
///
/// Script images travel through the pool, get queued, and may be
/// resubmitted after a worker crash; wrapping them in `Arc<Vec<u8>>`
/// makes every one of those handoffs a pointer copy.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Bytes(Arc<Vec<u8>>);

impl Bytes {
    /// Creates a new buffer from any type convertible to `Vec<u8>`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(data.into()))
    }

    /// Returns the number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the buffer contents as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Copies the buffer contents into a new `Vec<u8>`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Parses a buffer from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self::new(hex::decode(s)?))
    }

    /// Returns the buffer contents as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self::new(s)
    }
}

impl<const N: usize> From<[u8; N]> for Bytes {
    fn from(arr: [u8; N]) -> Self {
        Self::new(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_storage() {
        let a = Bytes::new(vec![1, 2, 3]);
        let b = a.clone();
        assert_eq!(a.as_slice().as_ptr(), b.as_slice().as_ptr());
    }

    #[test]
    fn hex_roundtrip() {
        let b = Bytes::new(vec![0xE0, 0x01]);
        assert_eq!(b.to_hex(), "e001");
        assert_eq!(Bytes::from_hex("e001").unwrap(), b);
    }

    #[test]
    fn from_hex_rejects_odd_length() {
        assert!(Bytes::from_hex("abc").is_err());
    }

    #[test]
    fn empty_hex_is_empty_buffer() {
        assert!(Bytes::from_hex("").unwrap().is_empty());
    }
}
