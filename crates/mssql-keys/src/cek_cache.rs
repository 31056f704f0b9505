//! TTL cache of unwrapped column encryption keys.
//!
//! Unwrapping a key costs an asymmetric operation in an external key
//! store; the cache amortizes that across executions. Entries pre-derive
//! the cell cipher so a cache hit goes straight to encryption.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::cell::CellCipher;
use crate::Result;

/// Cache key: one unwrapped key per `(database, key, version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CekCacheKey {
    /// Database id.
    pub database_id: i32,
    /// Key id within the database.
    pub key_id: i32,
    /// Key version.
    pub key_version: i32,
}

impl CekCacheKey {
    /// Create a cache key.
    #[must_use]
    pub fn new(database_id: i32, key_id: i32, key_version: i32) -> Self {
        Self {
            database_id,
            key_id,
            key_version,
        }
    }
}

struct CekEntry {
    cipher: Arc<CellCipher>,
    unwrapped_at: Instant,
}

/// Thread-safe TTL cache of unwrapped keys and their derived cell ciphers.
pub struct CekCache {
    entries: RwLock<HashMap<CekCacheKey, CekEntry>>,
    ttl: Duration,
}

impl CekCache {
    /// Default time-to-live for cached keys.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

    /// Create a cache with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(Self::DEFAULT_TTL)
    }

    /// Create a cache with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up the cell cipher for a key, skipping expired entries.
    pub fn get(&self, key: &CekCacheKey) -> Option<Arc<CellCipher>> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| e.unwrapped_at.elapsed() < self.ttl)
            .map(|e| Arc::clone(&e.cipher))
    }

    /// Insert an unwrapped key, deriving and returning its cell cipher.
    pub fn insert(&self, key: CekCacheKey, cek: &[u8]) -> Result<Arc<CellCipher>> {
        let cipher = Arc::new(CellCipher::new(cek)?);
        self.entries.write().insert(
            key,
            CekEntry {
                cipher: Arc::clone(&cipher),
                unwrapped_at: Instant::now(),
            },
        );
        tracing::trace!(
            database_id = key.database_id,
            key_id = key.key_id,
            key_version = key.key_version,
            "cached unwrapped column encryption key"
        );
        Ok(cipher)
    }

    /// Look up, or unwrap through `unwrap` and cache.
    pub async fn get_or_unwrap<F, Fut>(
        &self,
        key: CekCacheKey,
        unwrap: F,
    ) -> Result<Arc<CellCipher>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>>>,
    {
        if let Some(cipher) = self.get(&key) {
            return Ok(cipher);
        }
        let cek = unwrap().await?;
        self.insert(key, &cek)
    }

    /// Drop one entry, e.g. after key rotation.
    pub fn remove(&self, key: &CekCacheKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop expired entries eagerly.
    pub fn evict_expired(&self) {
        self.entries
            .write()
            .retain(|_, e| e.unwrapped_at.elapsed() < self.ttl);
    }

    /// Number of live entries (expired ones may still be counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for CekCache {
    fn default() -> Self {
        Self::new()
    }
}
