//! The command aggregate and its public execution surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use mssql_keys::{CipherKeyEntry, ProviderRegistry};
use tds_rpc::WireValue;

use crate::batch::BatchMode;
use crate::cancel::CancelState;
use crate::completion::{AsyncSlot, EndMethod};
use crate::connection::{Connection, Transaction};
use crate::driver::Diagnostics;
use crate::enclave::{AttestationParameters, EnclavePackage, EnclaveProvider, EnclaveSession};
use crate::error::{Error, Result};
use crate::param::ParameterCollection;
use crate::prepare::PrepareState;
use crate::reader::CommandReader;
use crate::retry::RetryPolicy;

/// What the command text denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Free-form SQL text.
    TextBatch,
    /// A stored-procedure name.
    StoredProcedure,
}

/// Column-encryption setting of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnEncryptionSetting {
    /// Follow the connection's setting.
    UseConnectionDefault,
    /// Encrypt input parameters and decrypt results.
    Enabled,
    /// No transparent encryption for this command.
    Disabled,
    /// Decrypt result sets but never encrypt parameters.
    ResultSetOnly,
}

/// Tag consumed by the data-adapter collaborator when applying updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatedRowSource {
    /// Ignore returned values.
    None,
    /// Map output parameters back into the row.
    OutputParameters,
    /// Map the first returned record back into the row.
    FirstReturnedRecord,
    /// Both output parameters and the first record.
    Both,
}

/// Reader behaviors that shape execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandBehavior {
    /// Column metadata only; no rows are materialized server-side.
    pub schema_only: bool,
    /// Request key/browse metadata with the result.
    pub key_info: bool,
    /// At most one row is expected.
    pub single_row: bool,
    /// Columns will be read strictly left to right.
    pub sequential_access: bool,
}

/// Retry-relevant facts about the most recent execution attempt.
#[derive(Default)]
pub(crate) struct RetryFacts {
    pub cache_used: bool,
    pub enclave_session: Option<EnclaveSession>,
    pub attestation_url: Option<String>,
    pub fingerprint: Option<String>,
}

/// A client-side command: parameterized SQL text or a stored-procedure
/// invocation, executed over an established session.
///
/// Thread model: every mutating operation is single-writer except
/// [`Command::cancel`], which any thread may call at any time.
pub struct Command {
    pub(crate) text: String,
    pub(crate) kind: CommandKind,
    pub(crate) timeout_seconds: u32,
    pub(crate) updated_row_source: UpdatedRowSource,
    pub(crate) column_encryption_setting: ColumnEncryptionSetting,
    pub(crate) params: ParameterCollection,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    pub(crate) transaction: Option<std::sync::Weak<Transaction>>,
    pub(crate) prepare: PrepareState,
    /// `(text, parameter shape)` the live prepared plan was built for.
    pub(crate) prepared_shape: Option<(String, u64)>,
    pub(crate) hidden_prepare: bool,
    pub(crate) cancel: Arc<CancelState>,
    pub(crate) async_slot: Option<AsyncSlot>,
    pub(crate) batch: Option<BatchMode>,
    // Encryption workspace, refreshed per execution.
    pub(crate) keys_for_enclave: BTreeMap<u16, CipherKeyEntry>,
    pub(crate) enclave_package: Option<EnclavePackage>,
    pub(crate) attestation_params: Option<AttestationParameters>,
    pub(crate) custom_data: Option<Bytes>,
    pub(crate) requires_enclave: bool,
    pub(crate) caching_postponed: bool,
    pub(crate) retry_facts: RetryFacts,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) custom_providers: Option<Arc<ProviderRegistry>>,
    pub(crate) enclave_provider: Option<Arc<dyn EnclaveProvider>>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Command {
    /// Create a detached command.
    #[must_use]
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
            timeout_seconds: 30,
            updated_row_source: UpdatedRowSource::Both,
            column_encryption_setting: ColumnEncryptionSetting::UseConnectionDefault,
            params: ParameterCollection::new(),
            connection: None,
            transaction: None,
            prepare: PrepareState::Unprepared,
            prepared_shape: None,
            hidden_prepare: false,
            cancel: Arc::new(CancelState::new()),
            async_slot: None,
            batch: None,
            keys_for_enclave: BTreeMap::new(),
            enclave_package: None,
            attestation_params: None,
            custom_data: None,
            requires_enclave: false,
            caching_postponed: false,
            retry_facts: RetryFacts::default(),
            diagnostics: Diagnostics::default(),
            custom_providers: None,
            enclave_provider: None,
            retry_policy: None,
        }
    }

    /// Create a text-batch command.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text, CommandKind::TextBatch)
    }

    /// Create a stored-procedure command.
    #[must_use]
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::StoredProcedure)
    }

    /// The command text.
    #[must_use]
    pub fn command_text(&self) -> &str {
        &self.text
    }

    /// The command kind.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Replace the command text. Dirties any prepared plan.
    pub fn set_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_no_async()?;
        self.text = text.into();
        self.mark_dirty();
        Ok(())
    }

    /// The timeout in seconds; `0` disables the deadline.
    #[must_use]
    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds
    }

    /// Set the timeout in seconds; `0` disables the deadline.
    pub fn set_timeout_seconds(&mut self, seconds: u32) {
        self.timeout_seconds = seconds;
    }

    /// The data-adapter row-source tag.
    #[must_use]
    pub fn updated_row_source(&self) -> UpdatedRowSource {
        self.updated_row_source
    }

    /// Set the data-adapter row-source tag.
    pub fn set_updated_row_source(&mut self, source: UpdatedRowSource) {
        self.updated_row_source = source;
    }

    /// The command's column-encryption setting.
    #[must_use]
    pub fn column_encryption_setting(&self) -> ColumnEncryptionSetting {
        self.column_encryption_setting
    }

    /// Change the column-encryption setting.
    ///
    /// Rejected once batch mode has locked a conflicting setting.
    pub fn set_column_encryption_setting(
        &mut self,
        setting: ColumnEncryptionSetting,
    ) -> Result<()> {
        if let Some(batch) = &self.batch {
            if let Some(locked) = batch.setting() {
                if locked != setting {
                    return Err(Error::InvalidOperation(format!(
                        "batch locked to column encryption setting {locked:?}"
                    )));
                }
            }
        }
        self.column_encryption_setting = setting;
        Ok(())
    }

    /// The parameter collection.
    #[must_use]
    pub fn parameters(&self) -> &ParameterCollection {
        &self.params
    }

    /// Mutable access to the parameters; refused while an async operation
    /// is in flight.
    pub fn parameters_mut(&mut self) -> Result<&mut ParameterCollection> {
        self.ensure_no_async()?;
        Ok(&mut self.params)
    }

    /// The command's connection.
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    /// Attach the command to a connection.
    ///
    /// Forces the prepare state back to `Unprepared`: handles never
    /// survive a connection change.
    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) -> Result<()> {
        self.ensure_no_async()?;
        self.prepare.reset();
        self.prepared_shape = None;
        self.connection = Some(connection);
        Ok(())
    }

    /// Attach the command to a transaction owned by its connection.
    pub fn set_transaction(&mut self, transaction: &Arc<Transaction>) -> Result<()> {
        self.ensure_no_async()?;
        self.transaction = Some(Arc::downgrade(transaction));
        Ok(())
    }

    /// Register a command-local key-store provider registry, shadowing the
    /// process-wide one.
    pub fn set_key_store_providers(&mut self, registry: Arc<ProviderRegistry>) {
        self.custom_providers = Some(registry);
    }

    /// Register the enclave collaborator.
    pub fn set_enclave_provider(&mut self, provider: Arc<dyn EnclaveProvider>) {
        self.enclave_provider = Some(provider);
    }

    /// Override the retry policy for transient failures.
    pub fn set_retry_policy(&mut self, policy: Arc<dyn RetryPolicy>) {
        self.retry_policy = Some(policy);
    }

    /// The current prepare state.
    #[must_use]
    pub fn prepare_state(&self) -> &PrepareState {
        &self.prepare
    }

    /// Request preparation of the command's plan.
    ///
    /// A no-op for stored procedures, for text with no parameters, and
    /// when already prepared and clean. Otherwise the next execution sends
    /// the combined prepare-execute shape.
    pub fn prepare(&mut self) -> Result<()> {
        self.ensure_no_async()?;
        if self.connection.is_none() {
            return Err(Error::ConnectionMissing);
        }
        if self.kind == CommandKind::StoredProcedure || self.params.sendable_count() == 0 {
            return Ok(());
        }
        if self.is_dirty() {
            let (cc, rc) = self.connection_counters();
            self.prepare.invalidate(cc, rc);
            self.hidden_prepare = false;
        }
        if self.prepare.request_prepare() {
            tracing::debug!("prepare requested; next execution uses prepare-execute");
            self.hidden_prepare = false;
        }
        Ok(())
    }

    /// Demote any prepared plan back to prepare-pending.
    ///
    /// Failures here are swallowed by design; only fatal signals from the
    /// connection propagate elsewhere.
    pub fn unprepare(&mut self) {
        let (cc, rc) = self.connection_counters();
        self.prepare.unprepare(cc, rc);
    }

    /// Request cancellation of the in-flight operation.
    ///
    /// Callable from any thread; never fails; a best-effort suggestion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A cloneable handle other tasks can cancel through.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<CancelState> {
        Arc::clone(&self.cancel)
    }

    /// Reset cached metadata and the async slot; the command is reusable.
    pub fn dispose(&mut self) {
        self.async_slot = None;
        self.keys_for_enclave.clear();
        self.enclave_package = None;
        self.attestation_params = None;
        self.custom_data = None;
        self.requires_enclave = false;
        self.caching_postponed = false;
        self.params.reset_cipher_state();
        self.retry_facts = RetryFacts::default();
    }

    /// Enter (or extend) batch RPC mode by aggregating the current text
    /// and parameters as one more invocation.
    ///
    /// The first added command locks the encryption setting; later adds
    /// must agree.
    pub fn add_batch_command(&mut self) -> Result<()> {
        self.ensure_no_async()?;
        let setting = self.column_encryption_setting;
        let batch = self.batch.get_or_insert_with(BatchMode::new);
        batch.lock_setting(setting)?;
        let record = self.build_batch_record()?;
        if let Some(batch) = &mut self.batch {
            batch.push_rpc(record);
        }
        Ok(())
    }

    /// The batch state, when batch mode is active.
    #[must_use]
    pub fn batch(&self) -> Option<&BatchMode> {
        self.batch.as_ref()
    }

    /// Leave batch mode, discarding aggregated invocations.
    pub fn clear_batch(&mut self) {
        self.batch = None;
    }

    /// Diagnostic buffers of the most recent execution.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Faults of one batched invocation, reconstructed from its error and
    /// warning slices of the execution's diagnostic buffers.
    #[must_use]
    pub fn batch_errors(&self, index: usize) -> Vec<tds_rpc::ServerFault> {
        self.batch
            .as_ref()
            .map(|batch| {
                batch.errors_for(index, &self.diagnostics.errors, &self.diagnostics.warnings)
            })
            .unwrap_or_default()
    }

    // ---- public execution surface ---------------------------------------

    /// Execute and return the cumulative rows-affected count.
    pub async fn execute_non_query(&mut self) -> Result<u64> {
        self.execute_to_completion(CommandBehavior::default())
            .await
            .map(|pump| pump.rows_affected)
    }

    /// Execute and return the first column of the first row, `Null` when
    /// the result is empty.
    pub async fn execute_scalar(&mut self) -> Result<WireValue> {
        let pump = self
            .execute_to_completion(CommandBehavior::default())
            .await?;
        Ok(pump
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(WireValue::Null))
    }

    /// Execute and return a streaming reader over the result sets.
    pub async fn execute_reader(
        &mut self,
        behavior: CommandBehavior,
    ) -> Result<CommandReader<'_>> {
        self.execute_into_reader(behavior).await
    }

    /// Execute and assemble the XML document fragments of the result.
    pub async fn execute_xml_reader(&mut self) -> Result<String> {
        let pump = self
            .execute_to_completion(CommandBehavior::default())
            .await?;
        let mut document = String::new();
        for row in pump.rows {
            if let Some(value) = row.into_iter().next() {
                match value {
                    WireValue::String(s) => document.push_str(&s),
                    WireValue::Xml(_) => {
                        return Err(Error::Protocol(
                            "xml buffer reached the reader unmaterialized".into(),
                        ))
                    }
                    WireValue::Null => {}
                    other => {
                        return Err(Error::InvalidOperation(format!(
                            "execute_xml_reader used on a non-XML result ({other:?})"
                        )))
                    }
                }
            }
        }
        Ok(document)
    }

    /// Begin an asynchronous non-query execution.
    pub async fn begin_execute_non_query(
        &mut self,
        cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        self.begin_execution(EndMethod::NonQuery, CommandBehavior::default(), cancellation)
            .await
    }

    /// Finish an asynchronous non-query execution.
    pub async fn end_execute_non_query(&mut self) -> Result<u64> {
        self.end_execution(EndMethod::NonQuery)
            .await
            .map(|pump| pump.rows_affected)
    }

    /// Begin an asynchronous scalar execution.
    pub async fn begin_execute_scalar(
        &mut self,
        cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        self.begin_execution(EndMethod::Scalar, CommandBehavior::default(), cancellation)
            .await
    }

    /// Finish an asynchronous scalar execution.
    pub async fn end_execute_scalar(&mut self) -> Result<WireValue> {
        let pump = self.end_execution(EndMethod::Scalar).await?;
        Ok(pump
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(WireValue::Null))
    }

    /// Begin an asynchronous reader execution.
    pub async fn begin_execute_reader(
        &mut self,
        behavior: CommandBehavior,
        cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        self.begin_execution(EndMethod::Reader, behavior, cancellation)
            .await
    }

    /// Finish an asynchronous reader execution, installing the reader.
    pub async fn end_execute_reader(&mut self) -> Result<CommandReader<'_>> {
        self.end_execution_reader().await
    }

    /// Begin an asynchronous XML-reader execution.
    pub async fn begin_execute_xml_reader(
        &mut self,
        cancellation: Option<CancellationToken>,
    ) -> Result<()> {
        self.begin_execution(EndMethod::XmlReader, CommandBehavior::default(), cancellation)
            .await
    }

    /// Finish an asynchronous XML-reader execution.
    pub async fn end_execute_xml_reader(&mut self) -> Result<String> {
        let pump = self.end_execution(EndMethod::XmlReader).await?;
        let mut document = String::new();
        for row in pump.rows {
            if let Some(WireValue::String(s)) = row.into_iter().next() {
                document.push_str(&s);
            }
        }
        Ok(document)
    }

    // ---- shared state helpers -------------------------------------------

    pub(crate) fn ensure_no_async(&self) -> Result<()> {
        if self.async_slot.is_some() {
            return Err(Error::AsyncInProgress);
        }
        Ok(())
    }

    /// Whether the prepared plan no longer matches text or parameters.
    pub(crate) fn is_dirty(&self) -> bool {
        match &self.prepared_shape {
            None => true,
            Some((text, shape)) => {
                text != &self.text || *shape != self.params.shape_fingerprint()
            }
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        if self.prepare.is_prepared() {
            let (cc, rc) = self.connection_counters();
            self.prepare.invalidate(cc, rc);
            self.hidden_prepare = true;
            tracing::trace!("prepared plan dirtied; re-prepare scheduled");
        }
        self.prepared_shape = None;
    }

    pub(crate) fn connection_counters(&self) -> (u32, u32) {
        self.connection
            .as_ref()
            .map(|c| (c.close_count(), c.reconnect_count()))
            .unwrap_or((0, 0))
    }

    /// The effective encryption setting against a connection default.
    pub(crate) fn encryption_enabled(&self, connection: &Arc<dyn Connection>) -> bool {
        match self.column_encryption_setting {
            ColumnEncryptionSetting::Enabled => true,
            ColumnEncryptionSetting::Disabled | ColumnEncryptionSetting::ResultSetOnly => false,
            ColumnEncryptionSetting::UseConnectionDefault => {
                connection.is_column_encryption_enabled()
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("text_len", &self.text.len())
            .field("parameters", &self.params.len())
            .field("prepare", &self.prepare)
            .field("async_in_flight", &self.async_slot.is_some())
            .field("batch", &self.batch.as_ref().map(BatchMode::len))
            .finish()
    }
}
