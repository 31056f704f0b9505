//! The parameter encryption orchestrator.
//!
//! Runs only when the effective column-encryption setting is `Enabled`.
//! The fast path stamps parameters from the query metadata cache; the slow
//! path drives the `sp_describe_parameter_encryption` round trip, groups
//! the delivered keys, verifies master-key signatures for enclave-bound
//! keys, unwraps the symmetric keys through the registered providers, and
//! stamps each parameter with its cipher descriptor. Either way the result
//! is a [`CipherRuntime`]: the set of ready cell ciphers the record
//! builder encrypts with and the output binder decrypts with.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;

use mssql_keys::{
    global_providers, CekCache, CekCacheKey, CellCipher, CipherKeyEntry, CipherKeyValue,
    CipherMetadata, EncryptionKind, KeyError, ProviderRegistry, CELL_CIPHER_ALGORITHM_ID,
};
use tds_rpc::{AttestationInfoRow, CipherKeyRow, ParameterCipherRow, TokenEvent};

use crate::command::CommandKind;
use crate::connection::Connection;
use crate::driver::with_deadline;
use crate::enclave::{
    AttestationParameters, EnclavePackage, EnclaveProvider, EnclaveSession,
};
use crate::error::{Error, Result};
use crate::metadata_cache;
use crate::param::{ParamDirection, ParameterCollection};
use crate::rpc::RecordBuilder;
use crate::session::SessionLease;

/// Wire encryption-type byte for plaintext (unencrypted) parameters.
const ENCRYPTION_TYPE_PLAINTEXT: u8 = 0;

static CEK_CACHE: OnceLock<CekCache> = OnceLock::new();

/// The process-wide cache of unwrapped column encryption keys.
pub(crate) fn cek_cache() -> &'static CekCache {
    CEK_CACHE.get_or_init(CekCache::new)
}

/// Ready cell ciphers for one execution, keyed by lowercased bare name.
#[derive(Default)]
pub struct CipherRuntime {
    ciphers: HashMap<String, (Arc<CellCipher>, EncryptionKind)>,
}

impl CipherRuntime {
    pub(crate) fn insert(&mut self, bare_name: &str, cipher: Arc<CellCipher>, kind: EncryptionKind) {
        self.ciphers
            .insert(bare_name.to_ascii_lowercase(), (cipher, kind));
    }

    /// The cipher for a parameter, by bare name.
    #[must_use]
    pub fn for_parameter(&self, bare_name: &str) -> Option<(&Arc<CellCipher>, EncryptionKind)> {
        self.ciphers
            .get(&bare_name.to_ascii_lowercase())
            .map(|(c, k)| (c, *k))
    }

    /// Number of resolved ciphers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ciphers.len()
    }

    /// Whether no ciphers were resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ciphers.is_empty()
    }
}

/// What the orchestrator produced for one execution attempt.
pub(crate) struct EncryptionOutcome {
    pub runtime: CipherRuntime,
    pub cache_used: bool,
    pub requires_enclave: bool,
    pub keys_for_enclave: BTreeMap<u16, CipherKeyEntry>,
    pub enclave_session: Option<EnclaveSession>,
    pub enclave_package: Option<EnclavePackage>,
    pub attestation_params: Option<AttestationParameters>,
    pub custom_data: Option<Bytes>,
    /// Cache insert is deferred until the return-status discrimination.
    pub cache_insert_pending: bool,
}

/// Per-attempt inputs to the orchestrator.
pub(crate) struct OrchestratorContext<'a> {
    pub text: &'a str,
    pub kind: CommandKind,
    pub fingerprint: &'a str,
    pub batch_active: bool,
    pub is_retry: bool,
    pub deadline: Option<Instant>,
}

/// Drives parameter encryption for one execution attempt.
pub(crate) struct EncryptionOrchestrator<'a> {
    pub connection: Arc<dyn Connection>,
    pub enclave_provider: Option<Arc<dyn EnclaveProvider>>,
    pub custom_providers: Option<&'a ProviderRegistry>,
}

impl EncryptionOrchestrator<'_> {
    pub(crate) async fn resolve(
        &self,
        ctx: &OrchestratorContext<'_>,
        params: &mut ParameterCollection,
        lease: &mut SessionLease,
    ) -> Result<EncryptionOutcome> {
        if !self.connection.server_supports_column_encryption() {
            return Err(Error::ColumnEncryptionNotSupported);
        }

        // Fast path: stamp from the query metadata cache.
        if !ctx.batch_active && !ctx.is_retry && params.sendable_count() > 0 {
            if let Some(outcome) = self.try_fast_path(ctx, params).await? {
                return Ok(outcome);
            }
        }

        self.slow_path(ctx, params, lease).await
    }

    /// Cache hit: stamp parameters and rebuild the runtime without a round
    /// trip. Falls through (returning `None`) when the entry requires an
    /// enclave but no session is established yet.
    async fn try_fast_path(
        &self,
        ctx: &OrchestratorContext<'_>,
        params: &mut ParameterCollection,
    ) -> Result<Option<EncryptionOutcome>> {
        let cache = metadata_cache::global();
        if !cache.get_if_exists(ctx.fingerprint, params) {
            return Ok(None);
        }
        let entry = cache.entry(ctx.fingerprint);
        let enclave_required = entry.as_ref().is_some_and(|e| e.enclave_required);

        let mut enclave_session = None;
        let mut custom_data = None;
        let mut keys_for_enclave = BTreeMap::new();
        if enclave_required {
            let Some((provider, url)) = self.enclave_target() else {
                return Err(Error::AttestationUrlMissing);
            };
            let (session, data) = provider.get_session(&url, ctx.is_retry);
            let Some(session) = session else {
                // No attested session: the describe round trip must run so
                // the server can hand out attestation info.
                params.reset_cipher_state();
                return Ok(None);
            };
            enclave_session = Some(session);
            custom_data = data;
            for p in params.iter() {
                if let Some(cipher) = &p.cipher {
                    if cipher.key_entry.is_requested_by_enclave {
                        keys_for_enclave
                            .insert(cipher.key_entry.ordinal, (*cipher.key_entry).clone());
                    }
                }
            }
        }

        let runtime = self.runtime_from_params(params).await?;
        tracing::debug!(
            ciphers = runtime.len(),
            enclave = enclave_required,
            "parameter encryption resolved from cache"
        );

        let enclave_package = match (&enclave_session, enclave_required) {
            (Some(session), true) => {
                let (provider, _) = self
                    .enclave_target()
                    .unwrap_or_else(|| unreachable!("checked above"));
                let keys: Vec<CipherKeyEntry> = keys_for_enclave.values().cloned().collect();
                Some(provider.generate_enclave_package(session, &keys, ctx.text)?)
            }
            _ => None,
        };

        Ok(Some(EncryptionOutcome {
            runtime,
            cache_used: true,
            requires_enclave: enclave_required,
            keys_for_enclave,
            enclave_session,
            enclave_package,
            attestation_params: None,
            custom_data,
            cache_insert_pending: false,
        }))
    }

    /// The describe-parameter-encryption round trip.
    async fn slow_path(
        &self,
        ctx: &OrchestratorContext<'_>,
        params: &mut ParameterCollection,
        lease: &mut SessionLease,
    ) -> Result<EncryptionOutcome> {
        params.reset_cipher_state();

        // Attestation parameters ride along when an enclave is configured
        // and no attested session exists yet.
        let mut attestation_params = None;
        let mut custom_data = None;
        let mut cached_session = None;
        if let Some((provider, url)) = self.enclave_target() {
            let (session, data) = provider.get_session(&url, ctx.is_retry);
            custom_data = data;
            match session {
                Some(session) => cached_session = Some(session),
                None => {
                    let protocol = self.connection.attestation_protocol();
                    attestation_params =
                        Some(provider.get_attestation_parameters(protocol, &url).await?);
                }
            }
        }

        let statement = match ctx.kind {
            CommandKind::TextBatch => ctx.text.to_owned(),
            CommandKind::StoredProcedure => {
                RecordBuilder::new(params, None).exec_preview(ctx.text)?
            }
        };
        let attestation_blob = match (&attestation_params, &self.enclave_provider) {
            (Some(ap), Some(provider)) => Some(provider.serialize_attestation_parameters(ap)),
            _ => None,
        };
        let describe = RecordBuilder::new(params, None)
            .describe_parameter_encryption(&statement, attestation_blob.clone())?;

        tracing::debug!(
            statement_len = statement.len(),
            attestation = attestation_blob.is_some(),
            "running describe-parameter-encryption round trip"
        );
        with_deadline(ctx.deadline, lease.session().write_rpc(&[describe], false)).await??;

        // Read the three result sets.
        let mut result_set = 0usize;
        let mut key_rows: Vec<CipherKeyRow> = Vec::new();
        let mut param_rows: Vec<ParameterCipherRow> = Vec::new();
        let mut attestation_rows: Vec<AttestationInfoRow> = Vec::new();
        let mut first_fault = None;
        loop {
            let event = with_deadline(ctx.deadline, lease.session().next_event()).await??;
            let Some(event) = event else { break };
            match event {
                TokenEvent::ResultMetadata(_) => result_set += 1,
                TokenEvent::Row(values) => match result_set {
                    1 => key_rows.push(CipherKeyRow::decode(&values)?),
                    2 => param_rows.push(ParameterCipherRow::decode(&values)?),
                    3 => attestation_rows.push(AttestationInfoRow::decode(&values)?),
                    n => {
                        return Err(Error::Protocol(format!(
                            "describe-parameter-encryption returned unexpected result set {n}"
                        )))
                    }
                },
                TokenEvent::Error(fault) => {
                    if first_fault.is_none() {
                        first_fault = Some(fault);
                    }
                }
                TokenEvent::Done(done) | TokenEvent::DoneProc(done) | TokenEvent::DoneInProc(done) => {
                    if done.attention_ack {
                        return Err(Error::Cancelled);
                    }
                }
                TokenEvent::Info(_)
                | TokenEvent::ReturnStatus(_)
                | TokenEvent::ReturnValue(_) => {}
            }
        }
        if let Some(fault) = first_fault {
            return Err(Error::Server(fault));
        }

        // Result set 1: group key rows by ordinal; one ordinal may carry
        // several wrapped copies of the same key.
        let mut keys: BTreeMap<u16, CipherKeyEntry> = BTreeMap::new();
        let mut signatures: HashMap<u16, (String, String, Option<Bytes>)> = HashMap::new();
        for row in key_rows {
            let entry = keys
                .entry(row.key_ordinal)
                .or_insert_with(|| CipherKeyEntry::new(row.key_ordinal));
            entry.is_requested_by_enclave |= row.is_requested_by_enclave;
            if row.is_requested_by_enclave {
                signatures.insert(
                    row.key_ordinal,
                    (
                        row.provider_name.clone(),
                        row.key_path.clone(),
                        row.key_signature.clone(),
                    ),
                );
            }
            entry.push_value(CipherKeyValue {
                encrypted_key: row.encrypted_key,
                database_id: row.database_id,
                key_id: row.key_id,
                key_version: row.key_version,
                key_metadata_version: row.key_metadata_version,
                key_path: row.key_path,
                key_store_provider_name: row.provider_name,
                algorithm_name: row.key_encryption_algorithm,
            });
        }

        // Enclave-requested keys: verify the master-key signature before
        // any key material goes near an enclave.
        let mut requires_enclave = false;
        let mut keys_for_enclave: BTreeMap<u16, CipherKeyEntry> = BTreeMap::new();
        for (ordinal, (provider_name, key_path, signature)) in signatures {
            let provider = ProviderRegistry::resolve(
                self.custom_providers,
                global_providers(),
                &provider_name,
            )?;
            let signature = signature.ok_or_else(|| {
                Error::Keys(KeyError::SignatureVerificationFailed(key_path.clone()))
            })?;
            let verified = provider
                .verify_column_master_key_signature(&key_path, true, &signature)
                .await?;
            if !verified {
                return Err(Error::Keys(KeyError::SignatureVerificationFailed(key_path)));
            }
            if let Some(entry) = keys.get(&ordinal) {
                keys_for_enclave.insert(ordinal, entry.clone());
            }
            requires_enclave = true;
        }

        // Result set 2: stamp parameters and unwrap their symmetric keys.
        let shared_keys: BTreeMap<u16, Arc<CipherKeyEntry>> = keys
            .iter()
            .map(|(ord, entry)| (*ord, Arc::new(entry.clone())))
            .collect();
        let mut runtime = CipherRuntime::default();
        for row in param_rows {
            // Ordinal string equality on the wire name, `@` included.
            let Some(param) = params.iter_mut().find(|p| {
                let bare = p.name.strip_prefix('@').unwrap_or(&p.name);
                row.parameter_name.strip_prefix('@') == Some(bare)
            }) else {
                return Err(Error::Protocol(format!(
                    "describe-parameter-encryption mentioned unknown parameter `{}`",
                    row.parameter_name
                )));
            };
            param.has_received_metadata = true;
            if row.encryption_type == ENCRYPTION_TYPE_PLAINTEXT {
                continue;
            }
            if row.algorithm_id != CELL_CIPHER_ALGORITHM_ID {
                return Err(Error::Keys(KeyError::UnsupportedAlgorithm(row.algorithm_id)));
            }
            let key_entry = shared_keys.get(&row.key_ordinal).ok_or_else(|| {
                Error::Protocol(format!(
                    "parameter `{}` references unknown key ordinal {}",
                    row.parameter_name, row.key_ordinal
                ))
            })?;
            let metadata = CipherMetadata {
                key_entry: Arc::clone(key_entry),
                algorithm_id: row.algorithm_id,
                encryption_type: row.encryption_type,
                normalization_rule_version: row.normalization_rule_version,
            };
            let (cipher, kind) = self.unwrap_cipher(&metadata).await?;
            let bare = param.bare_name().to_owned();
            param.cipher = Some(metadata);
            runtime.insert(&bare, cipher, kind);
        }

        // Every non-return-value parameter must have been covered.
        for p in params.iter() {
            if p.direction != ParamDirection::ReturnValue && !p.has_received_metadata {
                return Err(Error::ParameterEncryptionMetadataMissing(p.name.clone()));
            }
        }

        // Result set 3: attestation info, exactly one row when requested.
        let mut enclave_session = cached_session;
        if requires_enclave {
            let Some((provider, url)) = self.enclave_target() else {
                return Err(Error::AttestationUrlMissing);
            };
            if enclave_session.is_none() {
                if attestation_rows.len() != 1 {
                    return Err(Error::Protocol(format!(
                        "expected exactly one attestation-info row, got {}",
                        attestation_rows.len()
                    )));
                }
                let protocol = self.connection.attestation_protocol();
                enclave_session = Some(
                    provider
                        .create_session(protocol, &url, &attestation_rows[0].attestation_info)
                        .await?,
                );
                tracing::debug!("enclave session established");
            }
        }

        let enclave_package = match (&enclave_session, requires_enclave) {
            (Some(session), true) => {
                let (provider, _) = self
                    .enclave_target()
                    .unwrap_or_else(|| unreachable!("checked above"));
                let entries: Vec<CipherKeyEntry> = keys_for_enclave.values().cloned().collect();
                Some(provider.generate_enclave_package(session, &entries, &statement)?)
            }
            _ => None,
        };

        // Cache the outcome; postponed when a return-value parameter still
        // awaits the return-status discrimination. A retry attempt never
        // re-caches: the invalidation it was entered under must stick.
        let mut cache_insert_pending = false;
        if !ctx.batch_active && !ctx.is_retry {
            if params.first_return_value().is_some() {
                cache_insert_pending = true;
            } else {
                metadata_cache::global().add(
                    ctx.fingerprint.to_owned(),
                    params,
                    true,
                    requires_enclave,
                );
            }
        }

        Ok(EncryptionOutcome {
            runtime,
            cache_used: false,
            requires_enclave,
            keys_for_enclave,
            enclave_session,
            enclave_package,
            attestation_params,
            custom_data,
            cache_insert_pending,
        })
    }

    /// Rebuild the cipher runtime from already-stamped parameters.
    pub(crate) async fn runtime_from_params(
        &self,
        params: &ParameterCollection,
    ) -> Result<CipherRuntime> {
        let mut runtime = CipherRuntime::default();
        for p in params.iter() {
            if let Some(metadata) = &p.cipher {
                let (cipher, kind) = self.unwrap_cipher(metadata).await?;
                runtime.insert(p.bare_name(), cipher, kind);
            }
        }
        Ok(runtime)
    }

    /// Unwrap the symmetric key behind one cipher descriptor.
    async fn unwrap_cipher(
        &self,
        metadata: &CipherMetadata,
    ) -> Result<(Arc<CellCipher>, EncryptionKind)> {
        if metadata.algorithm_id != CELL_CIPHER_ALGORITHM_ID {
            return Err(Error::Keys(KeyError::UnsupportedAlgorithm(
                metadata.algorithm_id,
            )));
        }
        let kind = EncryptionKind::from_wire(metadata.encryption_type).ok_or_else(|| {
            Error::Protocol(format!(
                "unknown encryption type {}",
                metadata.encryption_type
            ))
        })?;
        let key = metadata.key_entry.primary().ok_or_else(|| {
            Error::Protocol("cipher key entry holds no key values".into())
        })?;
        let cache_key = CekCacheKey::new(key.database_id, key.key_id, key.key_version);
        let custom = self.custom_providers;
        let cipher = cek_cache()
            .get_or_unwrap(cache_key, || async {
                let provider = ProviderRegistry::resolve(
                    custom,
                    global_providers(),
                    &key.key_store_provider_name,
                )?;
                provider
                    .decrypt_column_encryption_key(
                        &key.key_path,
                        &key.algorithm_name,
                        &key.encrypted_key,
                    )
                    .await
            })
            .await?;
        Ok((cipher, kind))
    }

    /// The enclave provider and attestation URL, when both are configured.
    fn enclave_target(&self) -> Option<(Arc<dyn EnclaveProvider>, String)> {
        match (&self.enclave_provider, self.connection.enclave_attestation_url()) {
            (Some(provider), Some(url)) => Some((Arc::clone(provider), url)),
            _ => None,
        }
    }
}
