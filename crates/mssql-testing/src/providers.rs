//! Test key-store and enclave providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use mssql_command::{
    AttestationParameters, AttestationProtocol, EnclavePackage, EnclaveProvider, EnclaveSession,
    Result,
};
use mssql_keys::{CipherKeyEntry, KeyError, KeyStoreProvider};

/// A key store that unwraps every key to one fixed 32-byte value.
///
/// The "wrapped" bytes on the wire are ignored; what matters for engine
/// tests is that encryption and decryption agree on the key.
pub struct TestKeyStoreProvider {
    name: String,
    key: [u8; 32],
    verify_result: bool,
    decryptions: AtomicUsize,
    verifications: AtomicUsize,
}

impl TestKeyStoreProvider {
    fn base(name: &str) -> Self {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7).wrapping_add(3);
        }
        Self {
            name: name.to_owned(),
            key,
            verify_result: true,
            decryptions: AtomicUsize::new(0),
            verifications: AtomicUsize::new(0),
        }
    }

    /// A provider named `TEST_KEY_STORE` with a fixed key.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::named("TEST_KEY_STORE")
    }

    /// A provider with a custom name.
    #[must_use]
    pub fn named(name: &str) -> Arc<Self> {
        Arc::new(Self::base(name))
    }

    /// A provider whose signature verification fails.
    #[must_use]
    pub fn rejecting_signatures(name: &str) -> Arc<Self> {
        let mut provider = Self::base(name);
        provider.verify_result = false;
        Arc::new(provider)
    }

    /// The fixed column encryption key this provider unwraps to.
    #[must_use]
    pub fn key(&self) -> [u8; 32] {
        self.key
    }

    /// Number of unwrap calls that reached the provider (cache misses).
    #[must_use]
    pub fn decryptions(&self) -> usize {
        self.decryptions.load(Ordering::SeqCst)
    }

    /// Number of signature verifications performed.
    #[must_use]
    pub fn verifications(&self) -> usize {
        self.verifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyStoreProvider for TestKeyStoreProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decrypt_column_encryption_key(
        &self,
        key_path: &str,
        _algorithm: &str,
        encrypted_key: &[u8],
    ) -> mssql_keys::Result<Vec<u8>> {
        self.decryptions.fetch_add(1, Ordering::SeqCst);
        if encrypted_key.is_empty() {
            return Err(KeyError::KeyDecryptionFailed {
                key_path: key_path.to_owned(),
                detail: "empty wrapped key".into(),
            });
        }
        Ok(self.key.to_vec())
    }

    async fn verify_column_master_key_signature(
        &self,
        _key_path: &str,
        _allow_enclave_computations: bool,
        _signature: &[u8],
    ) -> mssql_keys::Result<bool> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        Ok(self.verify_result)
    }
}

/// An enclave collaborator with canned attestation.
pub struct TestEnclaveProvider {
    sessions: Mutex<HashMap<String, EnclaveSession>>,
    next_session_id: AtomicU64,
    sessions_created: AtomicUsize,
    sessions_invalidated: AtomicUsize,
    packages_generated: AtomicUsize,
}

impl TestEnclaveProvider {
    /// A provider with no established sessions.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            sessions_created: AtomicUsize::new(0),
            sessions_invalidated: AtomicUsize::new(0),
            packages_generated: AtomicUsize::new(0),
        })
    }

    /// Number of sessions established through `create_session`.
    #[must_use]
    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    /// Number of sessions dropped through `invalidate_session`.
    #[must_use]
    pub fn sessions_invalidated(&self) -> usize {
        self.sessions_invalidated.load(Ordering::SeqCst)
    }

    /// Number of enclave packages assembled.
    #[must_use]
    pub fn packages_generated(&self) -> usize {
        self.packages_generated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnclaveProvider for TestEnclaveProvider {
    fn get_session(
        &self,
        attestation_url: &str,
        _is_retry: bool,
    ) -> (Option<EnclaveSession>, Option<Bytes>) {
        (
            self.sessions.lock().get(attestation_url).cloned(),
            Some(Bytes::from_static(b"custom-data")),
        )
    }

    async fn get_attestation_parameters(
        &self,
        protocol: AttestationProtocol,
        _attestation_url: &str,
    ) -> Result<AttestationParameters> {
        Ok(AttestationParameters {
            protocol,
            payload: Bytes::from_static(b"attestation-request"),
        })
    }

    fn serialize_attestation_parameters(&self, params: &AttestationParameters) -> Bytes {
        params.payload.clone()
    }

    async fn create_session(
        &self,
        _protocol: AttestationProtocol,
        attestation_url: &str,
        attestation_info: &[u8],
    ) -> Result<EnclaveSession> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        let session = EnclaveSession {
            session_id: self.next_session_id.fetch_add(1, Ordering::SeqCst),
            session_key: Bytes::copy_from_slice(attestation_info),
        };
        self.sessions
            .lock()
            .insert(attestation_url.to_owned(), session.clone());
        Ok(session)
    }

    fn invalidate_session(&self, attestation_url: &str, session: &EnclaveSession) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(attestation_url)
            .is_some_and(|s| s.session_id == session.session_id)
        {
            sessions.remove(attestation_url);
            self.sessions_invalidated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn generate_enclave_package(
        &self,
        session: &EnclaveSession,
        keys: &[CipherKeyEntry],
        _text: &str,
    ) -> Result<EnclavePackage> {
        self.packages_generated.fetch_add(1, Ordering::SeqCst);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&session.session_id.to_le_bytes());
        bytes.push(keys.len() as u8);
        Ok(EnclavePackage {
            bytes: Bytes::from(bytes),
        })
    }
}
