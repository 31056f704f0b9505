//! The process-wide query metadata cache.
//!
//! The describe-parameter-encryption round trip is a full extra RPC per
//! execution; this cache remembers its outcome per command fingerprint so
//! repeat executions can stamp their parameters without touching the
//! server. Entries can go stale — the server signals that with a
//! client-retry error, and the driver invalidates the entry before its
//! single retry.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;

use mssql_keys::{CipherKeyEntry, CipherMetadata};

use crate::command::ColumnEncryptionSetting;
use crate::param::{ParamDirection, ParameterCollection};

/// Default number of command fingerprints the cache retains.
pub const DEFAULT_CACHE_CAPACITY: usize = 2000;

/// Cached cipher facts for one parameter.
#[derive(Debug, Clone)]
pub struct CachedParameterCipher {
    /// Encryption type byte (1 deterministic, 2 randomized).
    pub encryption_type: u8,
    /// Cipher algorithm id.
    pub algorithm_id: u8,
    /// Opaque normalization rule version.
    pub normalization_rule_version: u8,
    /// The key that encrypts the parameter.
    pub key_entry: Arc<CipherKeyEntry>,
}

/// Cached outcome of one describe round trip.
#[derive(Debug, Default)]
pub struct CachedCommandMetadata {
    /// Per-parameter cipher facts, keyed by lowercased bare name.
    pub params: HashMap<String, CachedParameterCipher>,
    /// Whether the command requires enclave computations.
    pub enclave_required: bool,
}

/// The fingerprint that keys cache entries.
///
/// Includes the data source and database (cipher metadata never crosses
/// servers), the text, the parameter shape, and the effective encryption
/// setting. The full string is the key — a hash collision here would
/// stamp the wrong cipher metadata onto a parameter.
#[must_use]
pub fn command_fingerprint(
    data_source: &str,
    database: &str,
    text: &str,
    params: &ParameterCollection,
    setting: ColumnEncryptionSetting,
) -> String {
    format!(
        "{data_source}\u{1}{database}\u{1}{setting:?}\u{1}{text}\u{1}{}",
        params.shape_descriptor()
    )
}

/// LRU cache of describe-round-trip outcomes, guarded internally.
pub struct QueryMetadataCache {
    entries: Mutex<LruCache<String, Arc<CachedCommandMetadata>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

static GLOBAL: OnceLock<QueryMetadataCache> = OnceLock::new();

/// The process-wide cache instance.
#[must_use]
pub fn global() -> &'static QueryMetadataCache {
    GLOBAL.get_or_init(|| QueryMetadataCache::new(DEFAULT_CACHE_CAPACITY))
}

impl QueryMetadataCache {
    /// Create a cache with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or_else(|| {
            panic!("query metadata cache capacity must be non-zero");
        });
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint and stamp the parameters on a hit.
    ///
    /// Every non-return-value parameter is marked metadata-received;
    /// parameters named in the entry additionally get cipher metadata.
    /// Returns whether the lookup hit.
    pub fn get_if_exists(&self, fingerprint: &str, params: &mut ParameterCollection) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            entries.get(fingerprint).cloned()
        };
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("query metadata cache miss");
            return false;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            encrypted_params = entry.params.len(),
            enclave = entry.enclave_required,
            "query metadata cache hit"
        );

        for param in params.iter_mut() {
            if param.direction == ParamDirection::ReturnValue {
                continue;
            }
            if let Some(cached) = entry.params.get(&param.bare_name().to_ascii_lowercase()) {
                param.cipher = Some(CipherMetadata {
                    key_entry: Arc::clone(&cached.key_entry),
                    algorithm_id: cached.algorithm_id,
                    encryption_type: cached.encryption_type,
                    normalization_rule_version: cached.normalization_rule_version,
                });
            }
            param.has_received_metadata = true;
        }
        true
    }

    /// Record a describe outcome from the parameters' current cipher state.
    ///
    /// `ignore_return_value_params` skips return-value parameters, used
    /// when the return-status discrimination has not yet happened.
    pub fn add(
        &self,
        fingerprint: String,
        params: &ParameterCollection,
        ignore_return_value_params: bool,
        enclave_required: bool,
    ) {
        let mut cached = CachedCommandMetadata {
            params: HashMap::new(),
            enclave_required,
        };
        for param in params.iter() {
            if ignore_return_value_params && param.direction == ParamDirection::ReturnValue {
                continue;
            }
            if let Some(cipher) = &param.cipher {
                cached.params.insert(
                    param.bare_name().to_ascii_lowercase(),
                    CachedParameterCipher {
                        encryption_type: cipher.encryption_type,
                        algorithm_id: cipher.algorithm_id,
                        normalization_rule_version: cipher.normalization_rule_version,
                        key_entry: Arc::clone(&cipher.key_entry),
                    },
                );
            }
        }
        tracing::debug!(
            encrypted_params = cached.params.len(),
            "caching describe-parameter-encryption outcome"
        );
        self.entries.lock().put(fingerprint, Arc::new(cached));
    }

    /// The cached entry for a fingerprint, without stamping anything.
    #[must_use]
    pub fn entry(&self, fingerprint: &str) -> Option<Arc<CachedCommandMetadata>> {
        self.entries.lock().peek(fingerprint).cloned()
    }

    /// Drop the entry for a fingerprint, if present.
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.entries.lock().pop(fingerprint).is_some()
    }

    /// Whether a fingerprint is cached, without touching LRU order or stats.
    #[must_use]
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.lock().peek(fingerprint).is_some()
    }

    /// Number of cached fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Cache hits since creation.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses since creation.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Fraction of lookups that hit, zero when no lookups happened.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::param::Parameter;
    use tds_rpc::SqlType;

    fn key_entry() -> Arc<CipherKeyEntry> {
        let mut entry = CipherKeyEntry::new(1);
        entry.push_value(mssql_keys::CipherKeyValue {
            encrypted_key: bytes::Bytes::from_static(b"wrapped"),
            database_id: 1,
            key_id: 1,
            key_version: 1,
            key_metadata_version: [0; 8],
            key_path: "path".into(),
            key_store_provider_name: "TEST".into(),
            algorithm_name: "RSA_OAEP".into(),
        });
        Arc::new(entry)
    }

    fn params_with_cipher() -> ParameterCollection {
        let mut params = ParameterCollection::new();
        let mut p = Parameter::new("@ssn", SqlType::NVarChar).with_size(11);
        p.cipher = Some(CipherMetadata {
            key_entry: key_entry(),
            algorithm_id: 2,
            encryption_type: 1,
            normalization_rule_version: 1,
        });
        params.push(p);
        params.push(Parameter::new("@plain", SqlType::Int));
        params
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let params = ParameterCollection::new();
        let a = command_fingerprint(
            "srv",
            "db",
            "SELECT 1",
            &params,
            ColumnEncryptionSetting::Enabled,
        );
        let b = command_fingerprint(
            "srv",
            "db",
            "SELECT 2",
            &params,
            ColumnEncryptionSetting::Enabled,
        );
        let c = command_fingerprint(
            "srv",
            "db",
            "SELECT 1",
            &params,
            ColumnEncryptionSetting::Disabled,
        );
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_add_then_stamp() {
        let cache = QueryMetadataCache::new(16);
        let source = params_with_cipher();
        cache.add("fp".into(), &source, true, false);
        assert!(cache.contains("fp"));

        let mut fresh = ParameterCollection::new();
        fresh.push(Parameter::new("@ssn", SqlType::NVarChar).with_size(11));
        fresh.push(Parameter::new("@plain", SqlType::Int));

        assert!(cache.get_if_exists("fp", &mut fresh));
        let ssn = fresh.get_by_name("@ssn").unwrap();
        assert!(ssn.cipher.is_some());
        assert!(ssn.has_received_metadata);
        let plain = fresh.get_by_name("@plain").unwrap();
        assert!(plain.cipher.is_none());
        assert!(plain.has_received_metadata);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_miss_counts() {
        let cache = QueryMetadataCache::new(16);
        let mut params = ParameterCollection::new();
        assert!(!cache.get_if_exists("absent", &mut params));
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hit_ratio(), 0.0);
    }

    #[test]
    fn test_invalidate() {
        let cache = QueryMetadataCache::new(16);
        cache.add("fp".into(), &params_with_cipher(), true, false);
        assert!(cache.invalidate("fp"));
        assert!(!cache.invalidate("fp"));
        assert!(!cache.contains("fp"));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = QueryMetadataCache::new(2);
        cache.add("a".into(), &ParameterCollection::new(), true, false);
        cache.add("b".into(), &ParameterCollection::new(), true, false);
        cache.add("c".into(), &ParameterCollection::new(), true, false);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_return_value_skipped_when_ignored() {
        let cache = QueryMetadataCache::new(16);
        let mut params = ParameterCollection::new();
        let mut ret = Parameter::new("@ret", SqlType::Int)
            .with_direction(ParamDirection::ReturnValue);
        ret.cipher = Some(CipherMetadata {
            key_entry: key_entry(),
            algorithm_id: 2,
            encryption_type: 1,
            normalization_rule_version: 1,
        });
        params.push(ret);
        cache.add("fp".into(), &params, true, false);

        let mut fresh = ParameterCollection::new();
        fresh.push(
            Parameter::new("@ret", SqlType::Int).with_direction(ParamDirection::ReturnValue),
        );
        assert!(cache.get_if_exists("fp", &mut fresh));
        let ret = fresh.get(0).unwrap();
        // Return values are neither stamped nor marked received by a hit.
        assert!(ret.cipher.is_none());
        assert!(!ret.has_received_metadata);
    }
}
