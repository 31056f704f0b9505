//! # mssql-command
//!
//! The command execution engine for the TDS protocol.
//!
//! A [`Command`] takes parameterized SQL text or a stored-procedure
//! invocation, drives it to completion on an established session, and
//! returns result streams, scalar values, record counts, or XML
//! documents. The engine multiplexes four concerns over one session:
//!
//! - a prepare/execute lifecycle with hidden re-preparation when a
//!   command's text or parameter shape changes under a live plan
//! - a two-phase execution when input parameters need transparent
//!   encryption: a describe-parameter-encryption round trip (with a
//!   process-wide metadata cache) ahead of the real invocation
//! - a cancellation gate racing the single shared session, sampled
//!   immediately before and after session acquisition
//! - asynchronous begin/end execution pairs with exactly one classified
//!   retry after cache or enclave-session invalidation
//!
//! The wire parser, connection pool, key stores, and result reader live
//! behind the narrow traits in [`connection`], [`enclave`], and the
//! `mssql-keys` crate; the engine performs no I/O of its own.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_command::{Command, Parameter, ParamDirection};
//! use tds_rpc::{SqlType, WireValue};
//!
//! let mut cmd = Command::text("SELECT name FROM users WHERE id = @id");
//! cmd.set_connection(connection)?;
//! cmd.parameters_mut()?
//!     .push(Parameter::new("@id", SqlType::Int).with_value(WireValue::Int(7)));
//!
//! cmd.prepare()?;
//! let name = cmd.execute_scalar().await?;
//! ```

#![warn(missing_docs)]

pub mod batch;
pub mod cancel;
pub mod command;
pub mod connection;
pub mod enclave;
pub mod error;
pub mod metadata_cache;
pub mod param;
pub mod prepare;
pub mod reader;
pub mod retry;
pub mod rpc;
pub mod session;

mod completion;
mod driver;
mod encryption;
mod output;

// Re-export the primary surface.
pub use batch::BatchMode;
pub use cancel::CancelState;
pub use command::{
    ColumnEncryptionSetting, Command, CommandBehavior, CommandKind, UpdatedRowSource,
};
pub use completion::{Completion, EndMethod};
pub use connection::{
    AttentionHandle, Connection, ReconnectFuture, Session, Transaction, UdtFactory,
};
pub use driver::Diagnostics;
pub use enclave::{
    AttestationParameters, AttestationProtocol, EnclavePackage, EnclaveProvider, EnclaveSession,
};
pub use encryption::CipherRuntime;
pub use error::{
    Error, FailureClass, Result, TCE_CONVERSION_ERROR_CLIENT_RETRY,
    TCE_ENCLAVE_INVALID_SESSION_HANDLE,
};
pub use param::{ParamDirection, Parameter, ParameterCollection};
pub use prepare::PrepareState;
pub use reader::CommandReader;
pub use retry::{ExponentialBackoff, NoRetry, RetryPolicy};
pub use rpc::ExecuteShape;
