//! The narrow interfaces the engine consumes from its collaborators.
//!
//! The wire parser, connection pool, and network session are external to
//! this crate; the engine drives them through [`Connection`] and
//! [`Session`]. A [`Session`] is the per-connection I/O object: the engine
//! borrows it for one operation, writes a batch or RPC, and pulls typed
//! [`TokenEvent`]s until done.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tds_rpc::{RpcRecord, TokenEvent};

use crate::enclave::AttestationProtocol;
use crate::error::Result;

/// A pending reconnect the driver must await before writing.
pub type ReconnectFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Out-of-band cancellation entry point of a session.
///
/// Implementations send an attention token (or arrange for one) without
/// blocking; failures stay inside the implementation — cancel is a
/// best-effort suggestion and never reports errors to the caller.
pub trait AttentionHandle: Send + Sync {
    /// Ask the server to abandon the in-flight request.
    fn request_attention(&self);
}

/// The per-connection I/O session the command borrows for one operation.
#[async_trait]
pub trait Session: Send {
    /// Write raw batch text, optionally with an enclave package.
    async fn write_batch(&mut self, text: &str, enclave_package: Option<Bytes>) -> Result<()>;

    /// Write one or more RPC invocations in a single request.
    async fn write_rpc(&mut self, records: &[RpcRecord], in_schema: bool) -> Result<()>;

    /// Pull the next typed event of the response; `None` at end of stream.
    async fn next_event(&mut self) -> Result<Option<TokenEvent>>;

    /// Handle for out-of-band cancellation of this session.
    fn attention(&self) -> Arc<dyn AttentionHandle>;

    /// Record that the session is unusable (attention unacknowledged,
    /// parser state broken).
    fn mark_broken(&mut self);

    /// Whether the session has been marked broken.
    fn is_broken(&self) -> bool;
}

/// The connection that owns sessions and connection-scoped settings.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The reconnect future, when a reconnect is in progress.
    ///
    /// The driver awaits it (bounded by the remaining command timeout)
    /// before acquiring a session.
    fn pending_reconnect(&self) -> Option<ReconnectFuture>;

    /// Borrow the session for one operation.
    async fn acquire_session(&self) -> Result<Box<dyn Session>>;

    /// Give the session back; called on every catchable exit path.
    fn return_session(&self, session: Box<dyn Session>);

    /// A fatal signal occurred: abandon the connection without returning
    /// the session.
    fn doom(&self);

    /// Whether the connection default enables column encryption.
    fn is_column_encryption_enabled(&self) -> bool;

    /// Whether the server negotiated column-encryption support.
    fn server_supports_column_encryption(&self) -> bool;

    /// The server-reported enclave type, when one is configured.
    fn enclave_type(&self) -> Option<String>;

    /// The enclave attestation endpoint, when configured.
    fn enclave_attestation_url(&self) -> Option<String>;

    /// Which attestation protocol the connection is configured for.
    fn attestation_protocol(&self) -> AttestationProtocol;

    /// Current database name.
    fn database(&self) -> String;

    /// Data source (server) identity.
    fn data_source(&self) -> String;

    /// Times this connection has been closed and reopened from the pool.
    fn close_count(&self) -> u32;

    /// Times this connection has transparently reconnected.
    fn reconnect_count(&self) -> u32;

    /// Count one more in-flight asynchronous operation.
    fn increment_async_count(&self);

    /// Count one asynchronous operation finished.
    fn decrement_async_count(&self);

    /// Current in-flight asynchronous operation count.
    fn async_count(&self) -> usize;

    /// Factory that materializes UDT payloads, when registered.
    fn udt_factory(&self) -> Option<Arc<dyn UdtFactory>> {
        None
    }
}

/// Materializes a CLR user-defined type from its wire payload.
pub trait UdtFactory: Send + Sync {
    /// Produce the value for a UDT payload of the named type.
    fn materialize(&self, type_name: &str, payload: &Bytes) -> Result<tds_rpc::WireValue>;
}

/// A transaction owned by a connection.
///
/// Commands hold a weak reference; the engine only checks that the
/// transaction belongs to the command's connection before executing.
pub struct Transaction {
    connection: std::sync::Weak<dyn Connection>,
}

impl Transaction {
    /// Create a transaction bound to its owning connection.
    #[must_use]
    pub fn new(connection: &Arc<dyn Connection>) -> Self {
        Self {
            connection: Arc::downgrade(connection),
        }
    }

    /// Whether this transaction belongs to `connection`.
    #[must_use]
    pub fn belongs_to(&self, connection: &Arc<dyn Connection>) -> bool {
        self.connection
            .upgrade()
            .is_some_and(|owner| Arc::ptr_eq(&owner, connection))
    }
}
