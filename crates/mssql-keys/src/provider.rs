//! Key-store provider interface and registries.
//!
//! Column master keys live in external key stores; the engine reaches them
//! through [`KeyStoreProvider`]. Providers register globally, and a command
//! may carry a local registry that shadows the global one. Names beginning
//! with the reserved system prefix are refused in custom registries: those
//! slots belong to the driver's built-in providers.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{KeyError, Result};

static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();

/// The process-wide provider registry.
///
/// System providers register here; commands may shadow it with a custom
/// registry of their own.
#[must_use]
pub fn global_providers() -> &'static ProviderRegistry {
    GLOBAL.get_or_init(ProviderRegistry::system)
}

/// Reserved, case-insensitive prefix for system key-store providers.
pub const SYSTEM_PROVIDER_PREFIX: &str = "MSSQL_";

/// Access to a column-master-key store.
#[async_trait]
pub trait KeyStoreProvider: Send + Sync {
    /// The provider name as it appears in server metadata.
    fn name(&self) -> &str;

    /// Unwrap a column encryption key with the master key at `key_path`.
    async fn decrypt_column_encryption_key(
        &self,
        key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Vec<u8>>;

    /// Verify the signature over a column master key's metadata.
    ///
    /// `allow_enclave_computations` is part of the signed payload: a key
    /// signed without enclave permission must not be released to one.
    async fn verify_column_master_key_signature(
        &self,
        key_path: &str,
        allow_enclave_computations: bool,
        signature: &[u8],
    ) -> Result<bool>;
}

/// A set of named key-store providers.
///
/// Lookups on a command consult its local registry first, then the
/// process-wide one; see [`ProviderRegistry::resolve`].
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn KeyStoreProvider>>>,
    /// Custom registries refuse the reserved system prefix.
    custom: bool,
}

impl ProviderRegistry {
    /// Create the process-wide registry (system names allowed).
    #[must_use]
    pub fn system() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            custom: false,
        }
    }

    /// Create a custom (command-local) registry.
    #[must_use]
    pub fn custom() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            custom: true,
        }
    }

    /// Register a provider under its own name.
    ///
    /// Rejects empty names, duplicates, and (for custom registries) names
    /// carrying the reserved system prefix, case-insensitively.
    pub fn register(&self, provider: Arc<dyn KeyStoreProvider>) -> Result<()> {
        let name = provider.name().to_owned();
        if name.trim().is_empty() {
            return Err(KeyError::InvalidProviderRegistration(
                "provider name is empty".into(),
            ));
        }
        if self.custom
            && name
                .to_ascii_uppercase()
                .starts_with(SYSTEM_PROVIDER_PREFIX)
        {
            return Err(KeyError::ReservedProviderName(name));
        }
        let mut providers = self.providers.write();
        if providers.contains_key(&name) {
            return Err(KeyError::InvalidProviderRegistration(format!(
                "provider `{name}` is already registered"
            )));
        }
        tracing::debug!(provider = %name, custom = self.custom, "registered key store provider");
        providers.insert(name, provider);
        Ok(())
    }

    /// Look up a provider by exact name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyStoreProvider>> {
        self.providers.read().get(name).cloned()
    }

    /// Resolve a provider, consulting `local` (when present) before `global`.
    pub fn resolve(
        local: Option<&ProviderRegistry>,
        global: &ProviderRegistry,
        name: &str,
    ) -> Result<Arc<dyn KeyStoreProvider>> {
        if let Some(local) = local {
            if let Some(provider) = local.get(name) {
                return Ok(provider);
            }
        }
        global
            .get(name)
            .ok_or_else(|| KeyError::ProviderNotFound(name.to_owned()))
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    /// Whether no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
