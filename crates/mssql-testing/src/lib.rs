//! # mssql-testing
//!
//! In-process mock collaborators for the TDS command engine.
//!
//! The engine consumes its wire layer, connection, key stores, and
//! enclave through narrow traits; this crate implements all of them with
//! scripted, recording fakes so the engine's full behavior — prepare
//! lifecycle, encryption round trips, cancellation, retry — can be
//! exercised without a server.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::{responses, MockConnection, WrittenRequest};
//!
//! let connection = MockConnection::builder()
//!     .respond(|request| match request {
//!         WrittenRequest::Rpc { .. } => responses::scalar_int(5),
//!         WrittenRequest::Batch { .. } => responses::done(0),
//!     })
//!     .build();
//! ```

pub mod mock;
pub mod providers;
pub mod responses;

pub use mock::{MockConnection, MockConnectionBuilder, MockSession, WrittenRequest};
pub use providers::{TestEnclaveProvider, TestKeyStoreProvider};
