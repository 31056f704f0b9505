//! # mssql-keys
//!
//! Column-encryption key plumbing for the TDS command engine.
//!
//! Transparent parameter encryption uses a two-level key hierarchy: an
//! externally stored column master key wraps the symmetric column
//! encryption key that the describe round trip delivers inline. This crate
//! provides everything the command engine needs on the client side of that
//! hierarchy:
//!
//! - [`KeyStoreProvider`]: the narrow interface to external key stores,
//!   plus a global/command-local [`ProviderRegistry`] with the reserved
//!   system-prefix rule
//! - [`CekCache`]: a TTL cache of unwrapped column encryption keys keyed
//!   by `(database_id, key_id, key_version)`
//! - [`CellCipher`]: the AEAD_AES_256_CBC_HMAC_SHA_256 cell cipher used to
//!   encrypt parameter values and decrypt returned cells
//! - [`CipherKeyEntry`] / [`CipherMetadata`]: the per-key and per-parameter
//!   descriptors the describe round trip produces

#![warn(missing_docs)]

pub mod cek_cache;
pub mod cell;
pub mod entry;
pub mod provider;

pub use cek_cache::{CekCache, CekCacheKey};
pub use cell::{CellCipher, EncryptionKind, CELL_CIPHER_ALGORITHM_ID};
pub use entry::{CipherKeyEntry, CipherKeyValue, CipherMetadata};
pub use provider::{global_providers, KeyStoreProvider, ProviderRegistry, SYSTEM_PROVIDER_PREFIX};

use thiserror::Error;

/// Errors from key-store access, key unwrapping, or cell encryption.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No provider registered under the requested name.
    #[error("key store provider `{0}` is not registered")]
    ProviderNotFound(String),

    /// The provider name is reserved for system providers.
    #[error("key store provider name `{0}` uses the reserved system prefix")]
    ReservedProviderName(String),

    /// The provider name is empty or already registered.
    #[error("invalid key store provider registration: {0}")]
    InvalidProviderRegistration(String),

    /// The provider failed to unwrap a column encryption key.
    #[error("failed to decrypt column encryption key at `{key_path}`: {detail}")]
    KeyDecryptionFailed {
        /// Master-key path that was used.
        key_path: String,
        /// Provider-reported failure detail.
        detail: String,
    },

    /// The column-master-key signature did not verify.
    #[error("column master key signature verification failed for `{0}`")]
    SignatureVerificationFailed(String),

    /// The unwrapped key has the wrong length for the cell cipher.
    #[error("column encryption key must be {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Observed key length.
        actual: usize,
    },

    /// A cell could not be encrypted.
    #[error("cell encryption failed: {0}")]
    EncryptionFailed(String),

    /// A cell could not be decrypted or failed authentication.
    #[error("cell decryption failed: {0}")]
    DecryptionFailed(String),

    /// The cipher algorithm id is not the supported cell cipher.
    #[error("unsupported cipher algorithm id {0}")]
    UnsupportedAlgorithm(u8),
}

/// Result type for key operations.
pub type Result<T> = std::result::Result<T, KeyError>;
