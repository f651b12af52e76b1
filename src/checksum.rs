// src/checksum.rs

//! Content checksums
//!
//! A [`Checksum`] is a length-tagged digest value of up to 32 bytes. The
//! database never interprets the bytes; it only compares them, truncates
//! them for cache names, and round-trips them through the hexadecimal text
//! form used by the FDB format, the triggers file and script file names.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum digest size carried in a checksum (sha256)
pub const CHECKSUM_MAX: usize = 32;

/// Digest length of the legacy 160-bit form
pub const CHECKSUM_160: usize = 20;

/// Number of checksum bytes used in cache item names
pub const CACHE_CSUM_BYTES: usize = 4;

/// A length-tagged content checksum.
///
/// A zero length means "no checksum". Equality compares only the first
/// `len` bytes, so a truncated digest never aliases a full one of a
/// different length.
#[derive(Debug, Clone, Copy)]
pub struct Checksum {
    len: u8,
    data: [u8; CHECKSUM_MAX],
}

impl Checksum {
    /// The absent checksum
    pub const NONE: Checksum = Checksum {
        len: 0,
        data: [0; CHECKSUM_MAX],
    };

    /// Wrap raw digest bytes. Anything longer than [`CHECKSUM_MAX`] is an
    /// internal error and is truncated.
    pub fn from_bytes(bytes: &[u8]) -> Checksum {
        let len = bytes.len().min(CHECKSUM_MAX);
        let mut data = [0; CHECKSUM_MAX];
        data[..len].copy_from_slice(&bytes[..len]);
        Checksum {
            len: len as u8,
            data,
        }
    }

    /// Compute the sha256 checksum of `bytes`.
    pub fn digest(bytes: &[u8]) -> Checksum {
        Checksum::from_bytes(&Sha256::digest(bytes))
    }

    /// Compute the sha256 checksum of `bytes`, truncated to 160 bits.
    pub fn digest_160(bytes: &[u8]) -> Checksum {
        Checksum::from_bytes(&Sha256::digest(bytes)[..CHECKSUM_160])
    }

    /// Parse the hexadecimal text form.
    pub fn from_hex(s: &str) -> Result<Checksum> {
        let bytes = hex::decode(s).map_err(|e| Error::BadChecksum(format!("{s}: {e}")))?;
        if bytes.is_empty() || bytes.len() > CHECKSUM_MAX {
            return Err(Error::BadChecksum(format!("bad length {}", bytes.len())));
        }
        Ok(Checksum::from_bytes(&bytes))
    }

    pub fn is_none(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Truncate in place to 160 bits (no-op for shorter checksums).
    pub fn truncate_160(&mut self) {
        if self.len as usize > CHECKSUM_160 {
            self.len = CHECKSUM_160 as u8;
        }
    }

    /// Hexadecimal text form of the whole checksum.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Hexadecimal text form of the leading bytes used in cache names.
    pub fn cache_hex(&self) -> String {
        hex::encode(&self.as_bytes()[..self.len().min(CACHE_CSUM_BYTES)])
    }
}

impl PartialEq for Checksum {
    fn eq(&self, other: &Checksum) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Checksum {}

impl std::hash::Hash for Checksum {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let c = Checksum::digest(b"hello");
        let parsed = Checksum::from_hex(&c.to_hex()).unwrap();
        assert_eq!(c, parsed);
        assert_eq!(c.len(), CHECKSUM_MAX);
    }

    #[test]
    fn test_truncated_does_not_equal_full() {
        let full = Checksum::digest(b"hello");
        let mut short = full;
        short.truncate_160();
        assert_eq!(short.len(), CHECKSUM_160);
        assert_ne!(full, short);
        assert_eq!(short.as_bytes(), &full.as_bytes()[..CHECKSUM_160]);
    }

    #[test]
    fn test_none_checksum() {
        assert!(Checksum::NONE.is_none());
        assert_eq!(Checksum::NONE.to_hex(), "");
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(Checksum::from_hex("zz").is_err());
        assert!(Checksum::from_hex("").is_err());
        // 33 bytes is over the maximum
        assert!(Checksum::from_hex(&"ab".repeat(33)).is_err());
    }

    #[test]
    fn test_cache_hex_uses_leading_bytes() {
        let c = Checksum::digest(b"pkg");
        assert_eq!(c.cache_hex().len(), CACHE_CSUM_BYTES * 2);
        assert!(c.to_hex().starts_with(&c.cache_hex()));
    }
}
