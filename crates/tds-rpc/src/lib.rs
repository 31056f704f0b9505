//! # tds-rpc
//!
//! In-memory RPC invocation descriptors for the TDS command engine.
//!
//! This crate holds the passive wire-facing data model that sits between
//! the command executor and the wire layer:
//!
//! - [`SqlType`]: the closed enumeration of server data types with their
//!   signature and length rules
//! - [`RpcRecord`]: the descriptor the wire layer turns into an RPC token
//!   stream (procedure identity, system parameters, user parameters, and
//!   per-parameter option map)
//! - [`TokenEvent`]: the typed events the wire parser produces while a
//!   response is being read
//! - Multi-part identifier parsing and quoting for procedure and type names
//!
//! The crate performs no I/O. Encoding the descriptors into packets and
//! decoding packets into events are the wire layer's job; this crate only
//! fixes the shapes both sides agree on.

#![warn(missing_docs)]

pub mod ident;
pub mod record;
pub mod token;
pub mod types;
pub mod value;

pub use ident::{parse_multipart_identifier, quote_identifier};
pub use record::{
    MAX_RPC_NAME_BYTES, ParamOptions, ProcId, ProcIdent, RpcOptionFlags, RpcRecord, SystemParam,
    WireParam,
};
pub use token::{
    AttestationInfoRow, CipherKeyRow, DoneToken, MetaColumn, ParameterCipherRow, ReturnValueToken,
    ServerFault, TokenEvent,
};
pub use types::{SignatureModifier, SqlType};
pub use value::WireValue;

use thiserror::Error;

/// Errors produced while building or interpreting RPC descriptors.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// An argument exceeded its wire-format length cap.
    #[error("argument `{argument}` is {actual} bytes as UTF-16, limit is {limit}")]
    InvalidArgumentLength {
        /// Which argument was too long.
        argument: &'static str,
        /// Encoded length in bytes.
        actual: usize,
        /// Maximum allowed length in bytes.
        limit: usize,
    },

    /// An identifier could not be parsed as a multi-part name.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A describe-parameter-encryption row did not match the expected column layout.
    #[error("malformed {result_set} row: {detail}")]
    MalformedRow {
        /// Which result set the row came from.
        result_set: &'static str,
        /// What was wrong with it.
        detail: String,
    },
}

/// Result type for descriptor operations.
pub type Result<T> = std::result::Result<T, RpcError>;
