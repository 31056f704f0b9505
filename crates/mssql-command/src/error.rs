//! Engine error types and the failure taxonomy.

use std::sync::Arc;

use thiserror::Error;

use tds_rpc::ServerFault;

/// Server error raised when cached cipher metadata no longer matches the
/// server's; the client may retry once after invalidating its cache.
pub const TCE_CONVERSION_ERROR_CLIENT_RETRY: i32 = 33514;

/// Server error raised when the enclave session handle is no longer valid;
/// the client may retry once after invalidating the enclave session.
pub const TCE_ENCLAVE_INVALID_SESSION_HANDLE: i32 = 33195;

/// Errors surfaced by command execution.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The command is in a state that forbids the requested operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An RPC descriptor could not be built (includes name-length failures).
    #[error(transparent)]
    Rpc(#[from] tds_rpc::RpcError),

    /// Key-store, key-unwrap, or cell-cipher failure.
    #[error(transparent)]
    Keys(#[from] mssql_keys::KeyError),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// An asynchronous operation is already in flight on this command.
    #[error("an asynchronous operation is already in progress")]
    AsyncInProgress,

    /// No asynchronous operation is in flight.
    #[error("no asynchronous operation is in progress")]
    NoAsyncInProgress,

    /// The end method does not pair with the pending begin method.
    #[error("end method `{actual}` does not match pending `{expected}`")]
    MismatchedEndMethod {
        /// The method the pending begin expects.
        expected: &'static str,
        /// The method that was called.
        actual: &'static str,
    },

    /// No connection is assigned to the command.
    #[error("the command has no connection")]
    ConnectionMissing,

    /// The assigned transaction belongs to a different connection.
    #[error("the transaction does not belong to the command's connection")]
    TransactionMismatch,

    /// A pending reconnect did not finish within the command timeout.
    #[error("reconnect did not complete within the command timeout")]
    ReconnectTimeout,

    /// The command timed out.
    #[error("command timed out")]
    Timeout,

    /// The session or connection transitioned to broken.
    #[error("connection is broken: {0}")]
    ConnectionBroken(String),

    /// A fatal failure that dooms the connection.
    #[error("fatal connection failure: {0}")]
    ConnectionFatal(String),

    /// The server raised an error.
    #[error("server error {}: {}", .0.number, .0.message)]
    Server(ServerFault),

    /// The describe round trip omitted metadata for a parameter.
    #[error("cipher metadata missing for parameter `{0}`")]
    ParameterEncryptionMetadataMissing(String),

    /// The server flagged an invocation whose cipher metadata was never delivered.
    #[error("cipher metadata for the procedure was not delivered by the describe round trip")]
    ProcEncryptionMetadataMissing,

    /// Column encryption was requested but the server cannot do it.
    #[error("the server does not support column encryption")]
    ColumnEncryptionNotSupported,

    /// Enclave computations were required without an attestation URL.
    #[error("enclave computations require an attestation URL on the connection")]
    AttestationUrlMissing,

    /// The enclave collaborator asked for the execution to be retried.
    #[error("enclave session must be re-established; retry requested")]
    EnclaveRetryRequired,

    /// An I/O failure from the wire layer.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The response stream violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// The §7 failure taxonomy: what an error means for the connection and
/// whether the engine may act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Doom the connection; never return the session.
    ConnectionFatal,
    /// The session transitioned to broken; raise a database-style error.
    ConnectionBroken,
    /// Propagate cancellation.
    Cancelled,
    /// Protocol-signalled retryable; at most one retry after invalidation.
    Retryable,
    /// Surface directly to the caller.
    User,
}

impl Error {
    /// The server error number, when this wraps a server fault.
    #[must_use]
    pub fn server_number(&self) -> Option<i32> {
        match self {
            Self::Server(fault) => Some(fault.number),
            _ => None,
        }
    }

    /// Whether this is the stale-cipher-metadata retry signal.
    ///
    /// Only meaningful as a retry trigger when cached metadata was used
    /// for the failing attempt; the driver tracks that bit.
    #[must_use]
    pub fn is_stale_cipher_metadata(&self) -> bool {
        self.server_number() == Some(TCE_CONVERSION_ERROR_CLIENT_RETRY)
    }

    /// Whether this is the invalid-enclave-session retry signal.
    #[must_use]
    pub fn is_invalid_enclave_session(&self) -> bool {
        self.server_number() == Some(TCE_ENCLAVE_INVALID_SESSION_HANDLE)
    }

    /// Classify per the failure taxonomy.
    #[must_use]
    pub fn classification(&self) -> FailureClass {
        match self {
            Self::ConnectionFatal(_) => FailureClass::ConnectionFatal,
            Self::ConnectionBroken(_) => FailureClass::ConnectionBroken,
            Self::Cancelled => FailureClass::Cancelled,
            Self::EnclaveRetryRequired => FailureClass::Retryable,
            Self::Server(fault)
                if fault.number == TCE_CONVERSION_ERROR_CLIENT_RETRY
                    || fault.number == TCE_ENCLAVE_INVALID_SESSION_HANDLE =>
            {
                FailureClass::Retryable
            }
            _ => FailureClass::User,
        }
    }

    /// Whether the session may still be returned to the pool after this error.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        self.classification() != FailureClass::ConnectionFatal
    }
}

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(number: i32) -> Error {
        Error::Server(ServerFault {
            number,
            class: 16,
            state: 1,
            message: "test".into(),
            server: None,
            procedure: None,
            line: 1,
        })
    }

    #[test]
    fn test_retry_signal_numbers() {
        assert!(server_error(33514).is_stale_cipher_metadata());
        assert!(server_error(33195).is_invalid_enclave_session());
        assert!(!server_error(1205).is_stale_cipher_metadata());
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            Error::Cancelled.classification(),
            FailureClass::Cancelled
        );
        assert_eq!(
            Error::ConnectionFatal("oom".into()).classification(),
            FailureClass::ConnectionFatal
        );
        assert_eq!(
            Error::ConnectionBroken("attention unacknowledged".into()).classification(),
            FailureClass::ConnectionBroken
        );
        assert_eq!(
            server_error(33514).classification(),
            FailureClass::Retryable
        );
        assert_eq!(
            Error::EnclaveRetryRequired.classification(),
            FailureClass::Retryable
        );
        assert_eq!(server_error(102).classification(), FailureClass::User);
        assert_eq!(
            Error::AsyncInProgress.classification(),
            FailureClass::User
        );
    }

    #[test]
    fn test_catchable() {
        assert!(Error::Cancelled.is_catchable());
        assert!(server_error(33514).is_catchable());
        assert!(!Error::ConnectionFatal("stack overflow".into()).is_catchable());
    }
}
