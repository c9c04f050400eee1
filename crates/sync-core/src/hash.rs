//! Backup hashes
//!
//! A backup is addressed by the SHA-512 hash of its payload. The hash
//! of the predecessor version doubles as the optimistic-concurrency
//! token for updates; the all-zero value is reserved to mean "no
//! predecessor" and is never produced by hashing real data.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};

/// SHA-512 digest identifying one backup version
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackupHash([u8; 64]);

impl BackupHash {
    /// Reserved sentinel meaning "no predecessor".
    pub const ZERO: BackupHash = BackupHash([0u8; 64]);

    /// Compute the hash of a payload.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        debug_assert!(out != [0u8; 64], "SHA-512 produced the reserved zero digest");
        Self(out)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parse the base32 wire form used in request/response headers.
    pub fn from_base32(s: &str) -> Result<Self> {
        let bytes = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::InvalidEncoding(e.to_string()))?;
        if bytes.len() != 64 {
            return Err(Error::InvalidLength {
                expected: 64,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Base32 wire form
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// True for the reserved "no predecessor" value.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for BackupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

impl fmt::Debug for BackupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackupHash({})", &self.to_base32()[..16])
    }
}

/// Incremental hash context for streamed uploads
///
/// Opened when the request headers are accepted and fed one body chunk
/// at a time, so large bodies never need a second pass.
pub struct BackupHasher {
    inner: Sha512,
}

impl BackupHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha512::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish(self) -> BackupHash {
        let digest = self.inner.finalize();
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        BackupHash::from_bytes(out)
    }
}

impl Default for BackupHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_matches_incremental() {
        let data = b"Test-1";
        let direct = BackupHash::hash(data);
        let mut hasher = BackupHasher::new();
        hasher.update(b"Test");
        hasher.update(b"-1");
        assert_eq!(direct, hasher.finish());
    }

    #[test]
    fn test_base32_roundtrip() {
        let h = BackupHash::hash(b"roundtrip");
        let parsed = BackupHash::from_base32(&h.to_base32()).unwrap();
        assert_eq!(h, parsed);
        // lower-case input is accepted
        let parsed = BackupHash::from_base32(&h.to_base32().to_ascii_lowercase()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_zero_is_distinct() {
        assert!(BackupHash::ZERO.is_zero());
        assert!(!BackupHash::hash(b"").is_zero());
    }

    #[test]
    fn test_bad_encoding_rejected() {
        assert!(BackupHash::from_base32("!!!not-base32!!!").is_err());
        // valid base32, wrong length
        assert!(BackupHash::from_base32("AAAA").is_err());
    }
}
