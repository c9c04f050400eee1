//! Account identities and upload signatures
//!
//! An account is nothing but an EdDSA public key; whoever holds the
//! private key owns the account. Uploads are authorized by a signature
//! over the (old hash, new hash) pair, so a stolen blob cannot be
//! replayed against a different version chain.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::error::{Error, Result};
use crate::hash::BackupHash;

/// Domain separator mixed into every upload signature.
const UPLOAD_SIG_CONTEXT: &[u8] = b"sync backup upload v1";

/// 32-byte EdDSA public key identifying an account
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId([u8; 32]);

impl AccountId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse the base32 form used in URL paths.
    pub fn from_base32(s: &str) -> Result<Self> {
        let bytes = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::InvalidEncoding(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidLength {
                expected: 32,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Base32 form used in URL paths
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", &self.to_base32()[..16])
    }
}

/// EdDSA signature over an (old, new) backup hash pair
#[derive(Clone, Copy)]
pub struct AccountSignature([u8; 64]);

impl AccountSignature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parse the base32 form carried in the Sync-Signature header.
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

    /// Base32 form
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Verify this signature over the given hash transition.
    ///
    /// Returns false both for a signature that does not match and for
    /// an account key that is not a valid curve point; the caller
    /// cannot distinguish the two and should not need to.
    pub fn verify(&self, account: &AccountId, old: &BackupHash, new: &BackupHash) -> bool {
        let key = match VerifyingKey::from_bytes(account.as_bytes()) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig = Signature::from_bytes(&self.0);
        key.verify_strict(&upload_sig_message(old, new), &sig).is_ok()
    }
}

impl fmt::Debug for AccountSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountSignature({})", &self.to_base32()[..16])
    }
}

/// Sign an upload transition with the account's private key.
///
/// Server side only verifies; this lives here so clients and test
/// harnesses produce bit-identical messages.
pub fn sign_upload(key: &SigningKey, old: &BackupHash, new: &BackupHash) -> AccountSignature {
    let sig = key.sign(&upload_sig_message(old, new));
    AccountSignature::from_bytes(sig.to_bytes())
}

/// Account id for a given signing key.
pub fn account_for(key: &SigningKey) -> AccountId {
    AccountId::from_bytes(key.verifying_key().to_bytes())
}

fn upload_sig_message(old: &BackupHash, new: &BackupHash) -> Vec<u8> {
    let mut msg = Vec::with_capacity(UPLOAD_SIG_CONTEXT.len() + 128);
    msg.extend_from_slice(UPLOAD_SIG_CONTEXT);
    msg.extend_from_slice(old.as_bytes());
    msg.extend_from_slice(new.as_bytes());
    msg
}
