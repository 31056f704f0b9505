//! Per-key and per-parameter cipher descriptors.

use std::sync::Arc;

use bytes::Bytes;

/// One wrapped copy of a column encryption key.
///
/// A single key ordinal can accumulate several wrapped copies, one per
/// column master key that wraps it; the client only needs to unwrap one
/// through a provider it has registered.
#[derive(Debug, Clone, PartialEq)]
pub struct CipherKeyValue {
    /// The wrapped key bytes.
    pub encrypted_key: Bytes,
    /// Database id the key lives in.
    pub database_id: i32,
    /// Key id within the database.
    pub key_id: i32,
    /// Key version, advanced by rotation.
    pub key_version: i32,
    /// 8-byte metadata version.
    pub key_metadata_version: [u8; 8],
    /// Master-key path in the key store.
    pub key_path: String,
    /// Provider name that can unwrap this copy.
    pub key_store_provider_name: String,
    /// Asymmetric wrap algorithm, e.g. `RSA_OAEP`.
    pub algorithm_name: String,
}

/// A column encryption key as delivered by the describe round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct CipherKeyEntry {
    /// Ordinal the per-parameter cipher rows refer to.
    pub ordinal: u16,
    /// Wrapped copies of the key, one per wrapping master key.
    pub values: Vec<CipherKeyValue>,
    /// Whether the server's enclave asked for this key.
    pub is_requested_by_enclave: bool,
}

impl CipherKeyEntry {
    /// Start an entry for an ordinal.
    #[must_use]
    pub fn new(ordinal: u16) -> Self {
        Self {
            ordinal,
            values: Vec::new(),
            is_requested_by_enclave: false,
        }
    }

    /// Append another wrapped copy of the same key.
    pub fn push_value(&mut self, value: CipherKeyValue) {
        self.values.push(value);
    }

    /// The first wrapped copy; entries always hold at least one once built.
    #[must_use]
    pub fn primary(&self) -> Option<&CipherKeyValue> {
        self.values.first()
    }
}

/// Cipher metadata stamped onto one parameter.
///
/// Produced either by the describe round trip or by a query-metadata cache
/// hit; consumed by the record builder (to encrypt the outgoing value) and
/// the output binder (to decrypt a returned cell).
#[derive(Debug, Clone)]
pub struct CipherMetadata {
    /// The key that encrypts this parameter.
    pub key_entry: Arc<CipherKeyEntry>,
    /// Cipher algorithm id; 2 is the AEAD cell cipher.
    pub algorithm_id: u8,
    /// Encryption type: 1 deterministic, 2 randomized.
    pub encryption_type: u8,
    /// Opaque normalization rule version.
    pub normalization_rule_version: u8,
}
