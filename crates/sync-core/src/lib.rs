//! Wire-level types shared by the sync backup server and its clients
//!
//! Accounts are EdDSA public keys, backups are opaque blobs addressed
//! by their SHA-512 hash, and every upload is authorized by a signature
//! over the (old, new) hash pair.

pub mod amount;
pub mod error;
pub mod hash;
pub mod keys;

pub use amount::Amount;
pub use error::{Error, Result};
pub use hash::{BackupHash, BackupHasher};
pub use keys::{AccountId, AccountSignature};

/// Service name reported by the /config endpoint.
pub const SERVICE_NAME: &str = "sync";

/// Protocol version (current:revision:age).
pub const PROTOCOL_VERSION: &str = "1:0:1";

/// Header carrying the account signature over the hash pair.
pub const HEADER_SYNC_SIGNATURE: &str = "Sync-Signature";

/// Header carrying the predecessor hash of a returned backup.
pub const HEADER_SYNC_PREVIOUS: &str = "Sync-Previous";

/// Header carrying the payment URI on a 402 response.
pub const HEADER_TALER: &str = "Taler";
