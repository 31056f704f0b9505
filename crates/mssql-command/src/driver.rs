//! The execution driver.
//!
//! Sequences one execution: reconnect wait, the cancellation gate around
//! session acquisition, parameter-encryption orchestration, shape choice,
//! the RPC or batch write, and the token pump that feeds the output binder
//! and batch accounting. Classified encryption failures relaunch the whole
//! attempt exactly once after invalidating the metadata cache and the
//! enclave session.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tds_rpc::{MetaColumn, RpcRecord, ServerFault, TokenEvent, WireValue};

use crate::command::{Command, CommandBehavior, CommandKind};
use crate::completion::{AsyncSlot, Completion, EndMethod, SlotState, WrittenState};
use crate::connection::Connection;
use crate::encryption::{CipherRuntime, EncryptionOrchestrator, OrchestratorContext};
use crate::error::{Error, FailureClass, Result};
use crate::metadata_cache::{self, command_fingerprint};
use crate::output;
use crate::reader::CommandReader;
use crate::retry;
use crate::rpc::{choose_shape, ExecuteShape, RecordBuilder};
use crate::session::{AsyncCountGuard, SessionLease};

/// Await `fut`, bounded by the remaining time before `deadline`.
pub(crate) async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = T>,
) -> Result<T> {
    match deadline {
        None => Ok(fut.await),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::timeout(deadline - now, fut)
                .await
                .map_err(|_| Error::Timeout)
        }
    }
}

/// Everything one execution attempt resolved before its write.
pub(crate) struct AttemptContext {
    pub shape: ExecuteShape,
    pub behavior: CommandBehavior,
    pub runtime: Option<CipherRuntime>,
    pub cache_insert_pending: bool,
    pub fingerprint: Option<String>,
    pub deadline: Option<Instant>,
    /// Reset batch the reader issues on close, when a preamble was sent.
    pub reset_batch: Option<String>,
}

/// Accumulated response state while the token pump runs.
pub(crate) struct PumpState {
    pub result_index: usize,
    pub in_prepare: bool,
    pub prepare_handle: Option<i32>,
    pub rows_affected: u64,
    pub return_status: Option<i32>,
    pub postponed_insert_done: bool,
    pub columns: Vec<MetaColumn>,
    pub errors: Vec<ServerFault>,
    pub warnings: Vec<ServerFault>,
}

impl PumpState {
    pub(crate) fn new(shape: ExecuteShape) -> Self {
        Self {
            result_index: 0,
            in_prepare: matches!(shape, ExecuteShape::PrepExec { .. }),
            prepare_handle: None,
            rows_affected: 0,
            return_status: None,
            postponed_insert_done: false,
            columns: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// What a completed pump produced.
pub(crate) struct PumpResult {
    pub rows: Vec<Vec<WireValue>>,
    pub rows_affected: u64,
    #[allow(dead_code)] // Read by the data-adapter collaborator.
    pub return_status: Option<i32>,
}

/// Diagnostic buffers of the most recent execution.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Server errors, in arrival order.
    pub errors: Vec<ServerFault>,
    /// Server informational messages, in arrival order.
    pub warnings: Vec<ServerFault>,
}

impl Command {
    // ---- validation and attempt setup -----------------------------------

    pub(crate) fn validate_execute(&self) -> Result<Arc<dyn Connection>> {
        let connection = self
            .connection
            .as_ref()
            .cloned()
            .ok_or(Error::ConnectionMissing)?;
        if self.text.trim().is_empty() {
            return Err(Error::InvalidArgument(match self.kind {
                CommandKind::TextBatch => "command text is empty".into(),
                CommandKind::StoredProcedure => "stored procedure name is empty".into(),
            }));
        }
        if let Some(weak) = &self.transaction {
            if let Some(transaction) = weak.upgrade() {
                if !transaction.belongs_to(&connection) {
                    return Err(Error::TransactionMismatch);
                }
            }
        }
        Ok(connection)
    }

    fn make_deadline(&self) -> Option<Instant> {
        (self.timeout_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(self.timeout_seconds)))
    }

    /// Run the write phase of one attempt: reconnect wait, the cancel gate
    /// around acquisition, encryption orchestration, shape choice, write.
    pub(crate) async fn begin_attempt(
        &mut self,
        behavior: CommandBehavior,
        is_retry: bool,
    ) -> Result<(SessionLease, AttemptContext)> {
        let connection = self.validate_execute()?;
        let deadline = self.make_deadline();

        // Wait out an in-progress reconnect, racing the cancel signal.
        if let Some(reconnect) = connection.pending_reconnect() {
            let cancel = Arc::clone(&self.cancel);
            tokio::select! {
                outcome = with_deadline(deadline, reconnect) => match outcome {
                    Ok(inner) => inner?,
                    Err(Error::Timeout) => return Err(Error::ReconnectTimeout),
                    Err(e) => return Err(e),
                },
                () = cancel.cancelled() => {
                    self.cancel.clear_pending();
                    return Err(Error::Cancelled);
                }
            }
        }

        // Cancellation sampled immediately before acquisition. Observing
        // the flag consumes it, so the command stays usable afterwards.
        if self.cancel.is_pending() {
            self.cancel.clear_pending();
            return Err(Error::Cancelled);
        }
        let session = with_deadline(deadline, connection.acquire_session()).await??;
        let mut lease = SessionLease::new(session, Arc::clone(&connection));
        self.cancel.bind_session(lease.session().attention());
        // And again immediately after: a cancel that raced the acquisition
        // is honored here; the session observes it through its own path.
        if self.cancel.is_pending() {
            self.cancel.clear_pending();
            self.cancel.unbind_session();
            return Err(Error::Cancelled);
        }

        match self
            .prepare_and_write(&connection, &mut lease, behavior, is_retry, deadline)
            .await
        {
            Ok(ctx) => Ok((lease, ctx)),
            Err(e) => {
                self.cancel.unbind_session();
                if !e.is_catchable() {
                    lease.doom();
                }
                Err(e)
            }
        }
    }

    async fn prepare_and_write(
        &mut self,
        connection: &Arc<dyn Connection>,
        lease: &mut SessionLease,
        behavior: CommandBehavior,
        is_retry: bool,
        deadline: Option<Instant>,
    ) -> Result<AttemptContext> {
        let fingerprint = command_fingerprint(
            &connection.data_source(),
            &connection.database(),
            &self.text,
            &self.params,
            self.column_encryption_setting,
        );
        self.retry_facts = crate::command::RetryFacts {
            fingerprint: Some(fingerprint.clone()),
            ..Default::default()
        };

        // Batch records await cipher coverage until the orchestrator runs.
        let encryption = self.encryption_enabled(connection);
        if encryption {
            if let Some(batch) = &mut self.batch {
                for record in &mut batch.rpcs {
                    record.needs_fetch_parameter_encryption_metadata =
                        !record.user_params.is_empty();
                }
            }
        }

        let mut runtime = None;
        let mut cache_insert_pending = false;
        if encryption {
            let text = self.text.clone();
            let orchestrator = EncryptionOrchestrator {
                connection: Arc::clone(connection),
                enclave_provider: self.enclave_provider.clone(),
                custom_providers: self.custom_providers.as_deref(),
            };
            let octx = OrchestratorContext {
                text: &text,
                kind: self.kind,
                fingerprint: &fingerprint,
                batch_active: self.batch.is_some(),
                is_retry,
                deadline,
            };
            let outcome = orchestrator.resolve(&octx, &mut self.params, lease).await?;

            self.keys_for_enclave = outcome.keys_for_enclave;
            self.requires_enclave = outcome.requires_enclave;
            self.enclave_package = outcome.enclave_package;
            self.attestation_params = outcome.attestation_params;
            self.custom_data = outcome.custom_data;
            self.caching_postponed = outcome.cache_insert_pending;
            self.retry_facts.cache_used = outcome.cache_used;
            self.retry_facts.enclave_session = outcome.enclave_session;
            self.retry_facts.attestation_url = connection.enclave_attestation_url();
            cache_insert_pending = outcome.cache_insert_pending;
            runtime = Some(outcome.runtime);

            // The exchange covered every aggregated invocation.
            if let Some(batch) = &mut self.batch {
                for record in &mut batch.rpcs {
                    record.needs_fetch_parameter_encryption_metadata = false;
                }
            }
        } else {
            self.requires_enclave = false;
            self.enclave_package = None;
        }

        // A mutated text or parameter shape demotes the prepared plan.
        if self.prepare.is_prepared() && self.is_dirty() {
            self.mark_dirty();
        }

        let (cc, rc) = (connection.close_count(), connection.reconnect_count());
        let shape = choose_shape(
            self.kind,
            &self.prepare,
            self.batch.is_some(),
            self.params.sendable_count(),
            self.requires_enclave,
            cc,
            rc,
        );
        tracing::debug!(?shape, encryption, "execution shape chosen");

        // Stored-procedure schema behaviors get a preamble batch; the
        // matching reset is issued when the reader closes.
        let mut reset_batch = None;
        if self.kind == CommandKind::StoredProcedure
            && (behavior.schema_only || behavior.key_info)
        {
            let mut preamble = Vec::new();
            let mut reset = Vec::new();
            if behavior.key_info {
                preamble.push("SET NO_BROWSETABLE ON");
                reset.push("SET NO_BROWSETABLE OFF");
            }
            if behavior.schema_only {
                preamble.push("SET FMTONLY ON");
                reset.push("SET FMTONLY OFF");
            }
            with_deadline(deadline, lease.session().write_batch(&preamble.join(";"), None))
                .await??;
            reset_batch = Some(reset.join(";"));
        }

        let enclave_bytes = self.enclave_package.as_ref().map(|p| p.bytes.clone());
        match shape {
            ExecuteShape::RawText => {
                with_deadline(deadline, lease.session().write_batch(&self.text, enclave_bytes))
                    .await??;
            }
            ExecuteShape::Batch => {
                let batch = self
                    .batch
                    .as_mut()
                    .unwrap_or_else(|| unreachable!("batch shape without batch state"));
                if batch
                    .rpcs
                    .iter()
                    .any(|r| r.needs_fetch_parameter_encryption_metadata)
                {
                    return Err(Error::ProcEncryptionMetadataMissing);
                }
                batch.current_index = 0;
                if let Some(first) = batch.rpcs.first_mut() {
                    first.begin_diagnostics(0, 0);
                }
                let records = batch.rpcs.clone();
                with_deadline(
                    deadline,
                    lease.session().write_rpc(&records, behavior.schema_only),
                )
                .await??;
            }
            _ => {
                let builder = RecordBuilder::new(&self.params, runtime.as_ref());
                let mut record = match shape {
                    ExecuteShape::ExecuteSql => builder.execute_sql(&self.text)?,
                    ExecuteShape::PrepExec { handle } => builder.prepexec(handle, &self.text)?,
                    ExecuteShape::Execute { handle } => builder.execute(handle)?,
                    ExecuteShape::StoredProc => builder.stored_proc(&self.text)?,
                    ExecuteShape::RawText | ExecuteShape::Batch => unreachable!(),
                };
                record.enclave_package = enclave_bytes;
                with_deadline(
                    deadline,
                    lease
                        .session()
                        .write_rpc(std::slice::from_ref(&record), behavior.schema_only),
                )
                .await??;
            }
        }

        Ok(AttemptContext {
            shape,
            behavior,
            runtime,
            cache_insert_pending,
            fingerprint: Some(fingerprint),
            deadline,
            reset_batch,
        })
    }

    // ---- the token pump --------------------------------------------------

    /// Dispatch one response event. Returns the row when the event was one.
    pub(crate) fn absorb_event(
        &mut self,
        state: &mut PumpState,
        ctx: &AttemptContext,
        event: TokenEvent,
    ) -> Result<Option<Vec<WireValue>>> {
        match event {
            TokenEvent::ResultMetadata(columns) => {
                state.result_index += 1;
                state.columns = columns;
                Ok(None)
            }
            TokenEvent::Row(values) => Ok(Some(values)),
            TokenEvent::ReturnValue(token) => {
                if state.in_prepare {
                    // The first return value of a prepare-execute is the
                    // server's plan handle.
                    state.prepare_handle = token.value.as_i32();
                    state.in_prepare = false;
                    return Ok(None);
                }
                let factory = self.connection.as_ref().and_then(|c| c.udt_factory());
                output::bind_return_value(
                    &mut self.params,
                    &token,
                    ctx.runtime.as_ref(),
                    factory.as_deref(),
                )?;
                Ok(None)
            }
            TokenEvent::ReturnStatus(status) => {
                output::bind_return_status(&mut self.params, status);
                state.return_status = Some(status);
                if ctx.cache_insert_pending && !state.postponed_insert_done {
                    if let Some(fingerprint) = &ctx.fingerprint {
                        metadata_cache::global().add(
                            fingerprint.clone(),
                            &self.params,
                            false,
                            self.requires_enclave,
                        );
                    }
                    state.postponed_insert_done = true;
                }
                Ok(None)
            }
            TokenEvent::Done(done) | TokenEvent::DoneInProc(done) => {
                self.absorb_done(state, done)?;
                Ok(None)
            }
            TokenEvent::DoneProc(done) => {
                self.absorb_done(state, done)?;
                self.advance_batch(state, done);
                Ok(None)
            }
            TokenEvent::Error(fault) => {
                tracing::debug!(number = fault.number, class = fault.class, "server error");
                state.errors.push(fault);
                Ok(None)
            }
            TokenEvent::Info(fault) => {
                state.warnings.push(fault);
                Ok(None)
            }
        }
    }

    fn absorb_done(&mut self, state: &mut PumpState, done: tds_rpc::DoneToken) -> Result<()> {
        if done.attention_ack {
            return Err(Error::Cancelled);
        }
        if done.count_valid && !done.error {
            state.rows_affected += done.row_count;
        }
        Ok(())
    }

    fn advance_batch(&mut self, state: &PumpState, done: tds_rpc::DoneToken) {
        let Some(batch) = &mut self.batch else { return };
        let index = batch.current_index;
        if let Some(record) = batch.rpcs.get_mut(index) {
            record.records_affected = done.count_valid.then_some(done.row_count);
            record.cumulative_records_affected = state.rows_affected;
            record.end_diagnostics(state.errors.len(), state.warnings.len());
        }
        batch.current_index += 1;
        let next = batch.current_index;
        if let Some(record) = batch.rpcs.get_mut(next) {
            record.begin_diagnostics(state.errors.len(), state.warnings.len());
        }
    }

    /// Pump the whole response, collecting first-result-set rows.
    pub(crate) async fn pump_to_done(
        &mut self,
        lease: &mut SessionLease,
        ctx: &AttemptContext,
    ) -> Result<PumpResult> {
        let mut state = PumpState::new(ctx.shape);
        let mut rows = Vec::new();
        loop {
            let event = with_deadline(ctx.deadline, lease.session().next_event()).await??;
            let Some(event) = event else { break };
            if let Some(row) = self.absorb_event(&mut state, ctx, event)? {
                if state.result_index <= 1 {
                    rows.push(row);
                }
            }
        }
        self.conclude(state, rows)
    }

    /// Finish a pumped response: promote a fresh prepare handle, settle
    /// postponed caching, stash diagnostics, raise the first server error.
    pub(crate) fn conclude(
        &mut self,
        state: PumpState,
        rows: Vec<Vec<WireValue>>,
    ) -> Result<PumpResult> {
        if let Some(handle) = state.prepare_handle {
            let (cc, rc) = self.connection_counters();
            self.prepare.promote(handle, cc, rc);
            self.prepared_shape = Some((self.text.clone(), self.params.shape_fingerprint()));
            self.hidden_prepare = false;
            tracing::debug!(handle, "prepared plan handle received");
        }
        if state.postponed_insert_done {
            self.caching_postponed = false;
        }
        let first_error = state.errors.first().cloned();
        self.diagnostics = Diagnostics {
            errors: state.errors,
            warnings: state.warnings,
        };
        if let Some(fault) = first_error {
            return Err(Error::Server(fault));
        }
        Ok(PumpResult {
            rows,
            rows_affected: state.rows_affected,
            return_status: state.return_status,
        })
    }

    fn settle_lease(lease: SessionLease, error: Option<&Error>) {
        match error.map(Error::classification) {
            Some(FailureClass::ConnectionFatal) => lease.doom(),
            Some(FailureClass::ConnectionBroken) => {
                let mut lease = lease;
                lease.session().mark_broken();
            }
            _ => {}
        }
    }

    // ---- attempt and retry loops ----------------------------------------

    async fn run_attempt(
        &mut self,
        behavior: CommandBehavior,
        is_retry: bool,
    ) -> Result<PumpResult> {
        let (mut lease, ctx) = self.begin_attempt(behavior, is_retry).await?;
        let result = self.pump_to_done(&mut lease, &ctx).await;
        self.cancel.unbind_session();
        Self::settle_lease(lease, result.as_ref().err());
        result
    }

    pub(crate) fn should_retry_encryption(&self, error: &Error) -> bool {
        matches!(error, Error::EnclaveRetryRequired)
            || (self.retry_facts.cache_used && error.is_stale_cipher_metadata())
            || (self.retry_facts.enclave_session.is_some() && error.is_invalid_enclave_session())
    }

    pub(crate) fn invalidate_for_retry(&mut self) {
        if let Some(fingerprint) = &self.retry_facts.fingerprint {
            metadata_cache::global().invalidate(fingerprint);
        }
        if let (Some(session), Some(url), Some(provider)) = (
            &self.retry_facts.enclave_session,
            &self.retry_facts.attestation_url,
            &self.enclave_provider,
        ) {
            provider.invalidate_session(url, session);
        }
        tracing::debug!("invalidated cached encryption state before the single retry");
    }

    /// Run a full execution with the single encryption retry and the
    /// pluggable transient-failure policy.
    pub(crate) async fn execute_to_completion(
        &mut self,
        behavior: CommandBehavior,
    ) -> Result<PumpResult> {
        self.ensure_no_async()?;
        let mut tce_retried = false;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.run_attempt(behavior, tce_retried).await {
                Ok(pump) => return Ok(pump),
                Err(e) if !tce_retried && self.should_retry_encryption(&e) => {
                    self.invalidate_for_retry();
                    tce_retried = true;
                }
                Err(e) => {
                    if retry::is_transient(&e) {
                        let policy = self
                            .retry_policy
                            .clone()
                            .unwrap_or_else(retry::default_policy);
                        if let Some(delay) = policy.next_delay(&e, attempt) {
                            tracing::debug!(?delay, attempt, "transient failure; backing off");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Reader entry: retry classification applies to the write phase; the
    /// read phase surfaces through the reader itself.
    pub(crate) async fn execute_into_reader(
        &mut self,
        behavior: CommandBehavior,
    ) -> Result<CommandReader<'_>> {
        self.ensure_no_async()?;
        let mut tce_retried = false;
        loop {
            match self.begin_attempt(behavior, tce_retried).await {
                Ok((lease, ctx)) => return Ok(CommandReader::install(self, lease, ctx)),
                Err(e) if !tce_retried && self.should_retry_encryption(&e) => {
                    self.invalidate_for_retry();
                    tce_retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---- begin/end pairs -------------------------------------------------

    pub(crate) async fn begin_execution(
        &mut self,
        end_method: EndMethod,
        behavior: CommandBehavior,
        cancellation: Option<tokio_util::sync::CancellationToken>,
    ) -> Result<()> {
        self.ensure_no_async()?;
        let connection = self.validate_execute()?;

        let cancel_task = cancellation.map(|token| {
            let cancel = Arc::clone(&self.cancel);
            tokio::spawn(async move {
                token.cancelled().await;
                cancel.cancel();
            })
        });

        let close_count_at_begin = connection.close_count();
        let state = match self.begin_attempt(behavior, false).await {
            Ok((lease, ctx)) => {
                let guard = AsyncCountGuard::new(Arc::clone(&connection));
                SlotState::Written(Box::new(WrittenState {
                    lease,
                    guard,
                    attempt: ctx,
                }))
            }
            // Begin-stage failures surface when the end method runs.
            Err(e) => SlotState::Failed(Some(e)),
        };
        self.async_slot = Some(AsyncSlot {
            end_method,
            state,
            completion: Completion::new(),
            cancel_task,
            close_count_at_begin,
        });
        Ok(())
    }

    /// A connection close while the operation was pending invalidates it.
    fn closed_while_pending(&self, slot: &AsyncSlot) -> Option<Error> {
        let connection = self.connection.as_ref()?;
        (connection.close_count() != slot.close_count_at_begin).then(|| {
            Error::ConnectionBroken(
                "connection was closed while the asynchronous operation was pending".into(),
            )
        })
    }

    fn take_slot(&mut self, end_method: EndMethod) -> Result<AsyncSlot> {
        match &self.async_slot {
            None => Err(Error::NoAsyncInProgress),
            Some(slot) if slot.end_method != end_method => Err(Error::MismatchedEndMethod {
                expected: slot.end_method.name(),
                actual: end_method.name(),
            }),
            Some(_) => Ok(self
                .async_slot
                .take()
                .unwrap_or_else(|| unreachable!("checked above"))),
        }
    }

    pub(crate) async fn end_execution(&mut self, end_method: EndMethod) -> Result<PumpResult> {
        let mut slot = self.take_slot(end_method)?;
        if let Some(broken) = self.closed_while_pending(&slot) {
            slot.completion.try_set(false);
            return Err(broken);
        }
        let state = std::mem::replace(&mut slot.state, SlotState::Failed(None));
        let result = match state {
            SlotState::Failed(error) => Err(error.unwrap_or(Error::NoAsyncInProgress)),
            SlotState::Written(written) => {
                let WrittenState {
                    mut lease,
                    guard,
                    attempt,
                } = *written;
                let behavior = attempt.behavior;
                let result = self.pump_to_done(&mut lease, &attempt).await;
                self.cancel.unbind_session();
                Self::settle_lease(lease, result.as_ref().err());
                drop(guard);
                match result {
                    Err(e) if self.should_retry_encryption(&e) => {
                        // Relaunch the whole attempt exactly once; the
                        // guard above was balanced, the relaunch runs its
                        // own write and read.
                        self.invalidate_for_retry();
                        self.run_attempt(behavior, true).await
                    }
                    other => other,
                }
            }
        };
        slot.completion.try_set(result.is_ok());
        result
    }

    pub(crate) async fn end_execution_reader(&mut self) -> Result<CommandReader<'_>> {
        let mut slot = self.take_slot(EndMethod::Reader)?;
        if let Some(broken) = self.closed_while_pending(&slot) {
            slot.completion.try_set(false);
            return Err(broken);
        }
        let state = std::mem::replace(&mut slot.state, SlotState::Failed(None));
        match state {
            SlotState::Failed(error) => {
                let error = error.unwrap_or(Error::NoAsyncInProgress);
                slot.completion.try_set(false);
                Err(error)
            }
            SlotState::Written(written) => {
                slot.completion.try_set(true);
                let WrittenState {
                    lease,
                    guard,
                    attempt,
                } = *written;
                // The guard stays alive inside the reader and balances on
                // close.
                Ok(CommandReader::install_with_guard(
                    self,
                    lease,
                    attempt,
                    Some(guard),
                ))
            }
        }
    }

    // ---- batch record building ------------------------------------------

    pub(crate) fn build_batch_record(&mut self) -> Result<RpcRecord> {
        let builder = RecordBuilder::new(&self.params, None);
        let mut record = match self.kind {
            CommandKind::TextBatch => builder.execute_sql(&self.text)?,
            CommandKind::StoredProcedure => builder.stored_proc(&self.text)?,
        };
        record.needs_fetch_parameter_encryption_metadata = false;
        Ok(record)
    }
}
