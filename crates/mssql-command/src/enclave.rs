//! Enclave attestation collaborator interface.
//!
//! Servers with a secure enclave can evaluate predicates over encrypted
//! columns inside the enclave. Before the client releases key material to
//! it, the enclave must attest its identity; the engine drives that
//! handshake through [`EnclaveProvider`] and ships the keys in an
//! [`EnclavePackage`] alongside the real request.

use async_trait::async_trait;
use bytes::Bytes;

use mssql_keys::CipherKeyEntry;

use crate::error::Result;

/// Which attestation protocol the connection is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationProtocol {
    /// Azure attestation service.
    Aas,
    /// Host Guardian Service.
    Hgs,
    /// No attestation (trusted VBS enclaves).
    None,
}

/// Parameters the client sends so the server can produce attestation info.
#[derive(Debug, Clone)]
pub struct AttestationParameters {
    /// Protocol these parameters were generated for.
    pub protocol: AttestationProtocol,
    /// Opaque serialized payload for the describe round trip.
    pub payload: Bytes,
}

/// An established, attested enclave session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveSession {
    /// Server-assigned session id.
    pub session_id: u64,
    /// Negotiated session key material (opaque to the engine).
    pub session_key: Bytes,
}

/// The client-assembled blob carrying keys the enclave needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclavePackage {
    /// Serialized package bytes, transmitted with the real request.
    pub bytes: Bytes,
}

/// Drives attestation and enclave-session lifecycle.
#[async_trait]
pub trait EnclaveProvider: Send + Sync {
    /// A cached session for this attestation endpoint, when one exists,
    /// plus any provider custom data to echo into the describe request.
    fn get_session(
        &self,
        attestation_url: &str,
        is_retry: bool,
    ) -> (Option<EnclaveSession>, Option<Bytes>);

    /// Produce attestation parameters for the describe round trip.
    async fn get_attestation_parameters(
        &self,
        protocol: AttestationProtocol,
        attestation_url: &str,
    ) -> Result<AttestationParameters>;

    /// Serialize attestation parameters for the wire.
    fn serialize_attestation_parameters(&self, params: &AttestationParameters) -> Bytes;

    /// Establish a session from the server's attestation info row.
    async fn create_session(
        &self,
        protocol: AttestationProtocol,
        attestation_url: &str,
        attestation_info: &[u8],
    ) -> Result<EnclaveSession>;

    /// Drop a session the server no longer accepts.
    fn invalidate_session(&self, attestation_url: &str, session: &EnclaveSession);

    /// Assemble the package of keys the enclave needs for `text`.
    fn generate_enclave_package(
        &self,
        session: &EnclaveSession,
        keys: &[CipherKeyEntry],
        text: &str,
    ) -> Result<EnclavePackage>;
}
