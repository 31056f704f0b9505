//! Scripted mock connection and session.
//!
//! [`MockConnection`] implements the engine's `Connection` trait; every
//! acquired [`MockSession`] records what the engine writes and answers
//! from a user-supplied responder closure. Attention requests, session
//! return balance, the async counter, and close/reconnect counters are
//! all observable for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use mssql_command::{
    AttentionHandle, AttestationProtocol, Connection, Error, ReconnectFuture, Result, Session,
};
use tds_rpc::{DoneToken, RpcRecord, TokenEvent};

/// One request the engine wrote to a session.
#[derive(Debug, Clone)]
pub enum WrittenRequest {
    /// Raw batch text.
    Batch {
        /// The batch text.
        text: String,
        /// Enclave package sent alongside, when any.
        enclave_package: Option<Bytes>,
    },
    /// One or more RPC invocations.
    Rpc {
        /// The invocation descriptors, in write order.
        records: Vec<RpcRecord>,
        /// Whether schema-only mode was requested.
        in_schema: bool,
    },
}

impl WrittenRequest {
    /// The single RPC record of this request, for one-invocation asserts.
    ///
    /// # Panics
    ///
    /// Panics when the request is a batch or holds several records.
    #[must_use]
    pub fn rpc(&self) -> &RpcRecord {
        match self {
            Self::Rpc { records, .. } if records.len() == 1 => &records[0],
            other => panic!("expected a single-record RPC request, got {other:?}"),
        }
    }
}

/// Responder: maps each written request to the token events it answers.
pub type Responder = Arc<dyn Fn(&WrittenRequest) -> Vec<TokenEvent> + Send + Sync>;

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<WrittenRequest>>,
    responder: Mutex<Option<Responder>>,
    write_error: Mutex<Option<String>>,
}

/// Recorded attention state shared by session and tests.
#[derive(Default)]
pub struct MockAttention {
    requested: AtomicBool,
}

impl AttentionHandle for MockAttention {
    fn request_attention(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

/// The scripted session handed out by [`MockConnection`].
pub struct MockSession {
    shared: Arc<Shared>,
    queue: VecDeque<TokenEvent>,
    attention: Arc<MockAttention>,
    attention_acked: bool,
    broken: bool,
}

#[async_trait]
impl Session for MockSession {
    async fn write_batch(&mut self, text: &str, enclave_package: Option<Bytes>) -> Result<()> {
        let request = WrittenRequest::Batch {
            text: text.to_owned(),
            enclave_package,
        };
        self.record_and_queue(request)
    }

    async fn write_rpc(&mut self, records: &[RpcRecord], in_schema: bool) -> Result<()> {
        let request = WrittenRequest::Rpc {
            records: records.to_vec(),
            in_schema,
        };
        self.record_and_queue(request)
    }

    async fn next_event(&mut self) -> Result<Option<TokenEvent>> {
        if self.attention.requested.load(Ordering::SeqCst) && !self.attention_acked {
            self.queue.clear();
            self.attention_acked = true;
            return Ok(Some(TokenEvent::Done(DoneToken {
                attention_ack: true,
                ..DoneToken::default()
            })));
        }
        Ok(self.queue.pop_front())
    }

    fn attention(&self) -> Arc<dyn AttentionHandle> {
        Arc::clone(&self.attention) as Arc<dyn AttentionHandle>
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl MockSession {
    fn record_and_queue(&mut self, request: WrittenRequest) -> Result<()> {
        if let Some(message) = self.shared.write_error.lock().clone() {
            return Err(Error::ConnectionBroken(message));
        }
        let responder = self.shared.responder.lock().clone();
        let events = responder
            .map(|r| r(&request))
            .unwrap_or_else(|| vec![TokenEvent::Done(DoneToken::default())]);
        self.shared.requests.lock().push(request);
        self.queue.extend(events);
        Ok(())
    }
}

/// Builder for [`MockConnection`].
pub struct MockConnectionBuilder {
    responder: Option<Responder>,
    column_encryption_enabled: bool,
    server_supports_encryption: bool,
    enclave_attestation_url: Option<String>,
    enclave_type: Option<String>,
    attestation_protocol: AttestationProtocol,
}

impl MockConnectionBuilder {
    /// Script the responder.
    #[must_use]
    pub fn respond(
        mut self,
        responder: impl Fn(&WrittenRequest) -> Vec<TokenEvent> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Enable column encryption as the connection default.
    #[must_use]
    pub fn column_encryption(mut self, enabled: bool) -> Self {
        self.column_encryption_enabled = enabled;
        self.server_supports_encryption = self.server_supports_encryption || enabled;
        self
    }

    /// Whether the server negotiated column-encryption support.
    #[must_use]
    pub fn server_supports_encryption(mut self, supported: bool) -> Self {
        self.server_supports_encryption = supported;
        self
    }

    /// Configure an enclave attestation endpoint.
    #[must_use]
    pub fn enclave(mut self, attestation_url: &str, protocol: AttestationProtocol) -> Self {
        self.enclave_attestation_url = Some(attestation_url.to_owned());
        self.enclave_type = Some("VBS".to_owned());
        self.attestation_protocol = protocol;
        self
    }

    /// Finish the connection.
    #[must_use]
    pub fn build(self) -> Arc<MockConnection> {
        Arc::new(MockConnection {
            shared: Arc::new(Shared {
                requests: Mutex::new(Vec::new()),
                responder: Mutex::new(self.responder),
                write_error: Mutex::new(None),
            }),
            column_encryption_enabled: self.column_encryption_enabled,
            server_supports_encryption: self.server_supports_encryption,
            enclave_attestation_url: self.enclave_attestation_url,
            enclave_type: self.enclave_type,
            attestation_protocol: self.attestation_protocol,
            close_count: AtomicU32::new(0),
            reconnect_count: AtomicU32::new(0),
            async_count: AtomicIsize::new(0),
            acquired: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            doomed: AtomicBool::new(false),
            pending_reconnect: Mutex::new(None),
        })
    }
}

/// A scripted connection for engine tests.
pub struct MockConnection {
    shared: Arc<Shared>,
    column_encryption_enabled: bool,
    server_supports_encryption: bool,
    enclave_attestation_url: Option<String>,
    enclave_type: Option<String>,
    attestation_protocol: AttestationProtocol,
    close_count: AtomicU32,
    reconnect_count: AtomicU32,
    async_count: AtomicIsize,
    acquired: AtomicUsize,
    returned: AtomicUsize,
    doomed: AtomicBool,
    pending_reconnect: Mutex<Option<ReconnectFuture>>,
}

impl MockConnection {
    /// Start building a connection.
    #[must_use]
    pub fn builder() -> MockConnectionBuilder {
        MockConnectionBuilder {
            responder: None,
            column_encryption_enabled: false,
            server_supports_encryption: false,
            enclave_attestation_url: None,
            enclave_type: None,
            attestation_protocol: AttestationProtocol::None,
        }
    }

    /// Replace the responder mid-test.
    pub fn set_responder(
        &self,
        responder: impl Fn(&WrittenRequest) -> Vec<TokenEvent> + Send + Sync + 'static,
    ) {
        *self.shared.responder.lock() = Some(Arc::new(responder));
    }

    /// Make every subsequent write fail as a broken connection.
    pub fn fail_writes(&self, message: &str) {
        *self.shared.write_error.lock() = Some(message.to_owned());
    }

    /// Everything the engine has written so far.
    #[must_use]
    pub fn requests(&self) -> Vec<WrittenRequest> {
        self.shared.requests.lock().clone()
    }

    /// Number of requests written so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.shared.requests.lock().len()
    }

    /// Park a reconnect future the next execution must await.
    pub fn set_pending_reconnect(&self, fut: ReconnectFuture) {
        *self.pending_reconnect.lock() = Some(fut);
    }

    /// Advance the close counter, invalidating prepared handles.
    pub fn bump_close_count(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Advance the reconnect counter.
    pub fn bump_reconnect_count(&self) {
        self.reconnect_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Sessions handed out so far.
    #[must_use]
    pub fn sessions_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Sessions returned so far; equals acquisitions when balanced.
    #[must_use]
    pub fn sessions_returned(&self) -> usize {
        self.returned.load(Ordering::SeqCst)
    }

    /// Whether a fatal signal doomed the connection.
    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn pending_reconnect(&self) -> Option<ReconnectFuture> {
        self.pending_reconnect.lock().take()
    }

    async fn acquire_session(&self) -> Result<Box<dyn Session>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
            queue: VecDeque::new(),
            attention: Arc::new(MockAttention::default()),
            attention_acked: false,
            broken: false,
        }))
    }

    fn return_session(&self, _session: Box<dyn Session>) {
        self.returned.fetch_add(1, Ordering::SeqCst);
    }

    fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    fn is_column_encryption_enabled(&self) -> bool {
        self.column_encryption_enabled
    }

    fn server_supports_column_encryption(&self) -> bool {
        self.server_supports_encryption
    }

    fn enclave_type(&self) -> Option<String> {
        self.enclave_type.clone()
    }

    fn enclave_attestation_url(&self) -> Option<String> {
        self.enclave_attestation_url.clone()
    }

    fn attestation_protocol(&self) -> AttestationProtocol {
        self.attestation_protocol
    }

    fn database(&self) -> String {
        "testdb".to_owned()
    }

    fn data_source(&self) -> String {
        "tcp:mock,1433".to_owned()
    }

    fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }

    fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    fn increment_async_count(&self) {
        self.async_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_async_count(&self) {
        self.async_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn async_count(&self) -> usize {
        self.async_count.load(Ordering::SeqCst).max(0) as usize
    }
}
