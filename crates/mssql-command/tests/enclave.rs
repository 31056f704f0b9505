//! Enclave attestation: session establishment, package transmission, and
//! the single retry on an invalidated session handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mssql_command::{
    AttestationProtocol, Command, Error, Parameter, TCE_ENCLAVE_INVALID_SESSION_HANDLE,
};
use mssql_keys::ProviderRegistry;
use mssql_testing::{
    responses, MockConnection, TestEnclaveProvider, TestKeyStoreProvider, WrittenRequest,
};
use tds_rpc::{SqlType, TokenEvent, WireValue};

const PROVIDER: &str = "ENCLAVE_VAULT";
const ATTESTATION_URL: &str = "https://attest.example/v1";

fn is_describe(request: &WrittenRequest) -> bool {
    matches!(request, WrittenRequest::Rpc { records, .. }
        if records[0].procedure.name() == Some("sp_describe_parameter_encryption"))
}

fn enclave_describe_events() -> Vec<TokenEvent> {
    responses::DescribeResponse::new()
        .enclave_key(1, b"wrapped-key", PROVIDER, "cmk/enclave", b"cmk-signature")
        .param("@v", 2, 1)
        .attestation(b"attestation-evidence")
        .events()
}

fn enclave_command(
    connection: &Arc<MockConnection>,
    enclave: &Arc<TestEnclaveProvider>,
    text: &str,
) -> Command {
    let registry = ProviderRegistry::custom();
    registry.register(TestKeyStoreProvider::named(PROVIDER)).unwrap();

    let mut cmd = Command::text(text);
    cmd.set_connection(connection.clone()).unwrap();
    cmd.set_key_store_providers(Arc::new(registry));
    let provider: Arc<dyn mssql_command::EnclaveProvider> = enclave.clone();
    cmd.set_enclave_provider(provider);
    cmd.parameters_mut().unwrap().push(
        Parameter::new("@v", SqlType::NVarChar)
            .with_size(20)
            .with_value(WireValue::String("secret".into())),
    );
    cmd
}

fn enclave_connection() -> Arc<MockConnection> {
    MockConnection::builder()
        .column_encryption(true)
        .enclave(ATTESTATION_URL, AttestationProtocol::Aas)
        .respond(|request| {
            if is_describe(request) {
                enclave_describe_events()
            } else {
                responses::done(1)
            }
        })
        .build()
}

#[tokio::test]
async fn test_enclave_session_created_once_and_package_sent() {
    let connection = enclave_connection();
    let enclave = TestEnclaveProvider::new();
    let mut cmd = enclave_command(&connection, &enclave, "SELECT * FROM t WHERE v > @v");

    cmd.execute_non_query().await.unwrap();
    assert_eq!(enclave.sessions_created(), 1);
    assert_eq!(enclave.packages_generated(), 1);

    // The describe request carried the serialized attestation parameters.
    let requests = connection.requests();
    let describe = requests[0].rpc();
    assert!(describe
        .system_params
        .iter()
        .any(|p| p.name() == "@attestation_parameters"));

    // The real invocation carried the enclave package.
    let real = requests[1].rpc();
    assert!(real.enclave_package.is_some());

    // A second execution reuses the attested session.
    cmd.execute_non_query().await.unwrap();
    assert_eq!(enclave.sessions_created(), 1);
}

#[tokio::test]
async fn test_invalid_session_handle_retries_once() {
    let failures_left = Arc::new(AtomicUsize::new(0));
    let failures = Arc::clone(&failures_left);
    let connection = MockConnection::builder()
        .column_encryption(true)
        .enclave(ATTESTATION_URL, AttestationProtocol::Aas)
        .respond(move |request| {
            if is_describe(request) {
                enclave_describe_events()
            } else if failures.load(Ordering::SeqCst) > 0 {
                failures.fetch_sub(1, Ordering::SeqCst);
                responses::server_error(
                    TCE_ENCLAVE_INVALID_SESSION_HANDLE,
                    "invalid enclave session handle",
                )
            } else {
                responses::done(1)
            }
        })
        .build();
    let enclave = TestEnclaveProvider::new();
    let mut cmd = enclave_command(&connection, &enclave, "SELECT * FROM t WHERE v > @v -- retry");

    // Establish the session.
    cmd.execute_non_query().await.unwrap();
    assert_eq!(enclave.sessions_created(), 1);
    let baseline = connection.request_count();

    // The server rejects the session handle once; the engine invalidates
    // it, re-attests through a fresh describe, and succeeds.
    failures_left.store(1, Ordering::SeqCst);
    cmd.execute_non_query().await.unwrap();

    assert_eq!(enclave.sessions_invalidated(), 1);
    assert_eq!(enclave.sessions_created(), 2);
    // exec (fails) -> describe (re-attest) -> exec (succeeds).
    assert_eq!(connection.request_count() - baseline, 3);
}

#[tokio::test]
async fn test_invalid_session_handle_propagates_after_single_retry() {
    let connection = MockConnection::builder()
        .column_encryption(true)
        .enclave(ATTESTATION_URL, AttestationProtocol::Aas)
        .respond(|request| {
            if is_describe(request) {
                enclave_describe_events()
            } else {
                responses::server_error(
                    TCE_ENCLAVE_INVALID_SESSION_HANDLE,
                    "invalid enclave session handle",
                )
            }
        })
        .build();
    let enclave = TestEnclaveProvider::new();
    let mut cmd = enclave_command(
        &connection,
        &enclave,
        "SELECT * FROM t WHERE v > @v -- always invalid",
    );

    let error = cmd.execute_non_query().await.unwrap_err();
    assert_eq!(
        error.server_number(),
        Some(TCE_ENCLAVE_INVALID_SESSION_HANDLE)
    );
    // Attempt one established a session (describe + exec); the retry
    // re-attested (describe + exec) and then gave up.
    assert_eq!(connection.request_count(), 4);
    assert_eq!(enclave.sessions_created(), 2);
}

#[tokio::test]
async fn test_missing_attestation_url_fails() {
    // Enclave-requested keys without a configured attestation endpoint.
    let connection = MockConnection::builder()
        .column_encryption(true)
        .respond(|request| {
            if is_describe(request) {
                enclave_describe_events()
            } else {
                responses::done(1)
            }
        })
        .build();
    let enclave = TestEnclaveProvider::new();
    let mut cmd = enclave_command(&connection, &enclave, "SELECT * FROM t WHERE v > @v -- no url");

    let error = cmd.execute_non_query().await.unwrap_err();
    assert!(matches!(error, Error::AttestationUrlMissing));
}

#[tokio::test]
async fn test_rejected_master_key_signature_fails() {
    let connection = enclave_connection();
    let enclave = TestEnclaveProvider::new();

    let registry = ProviderRegistry::custom();
    registry
        .register(TestKeyStoreProvider::rejecting_signatures(PROVIDER))
        .unwrap();

    let mut cmd = Command::text("SELECT * FROM t WHERE v > @v -- bad signature");
    cmd.set_connection(connection.clone()).unwrap();
    cmd.set_key_store_providers(Arc::new(registry));
    let provider: Arc<dyn mssql_command::EnclaveProvider> = enclave.clone();
    cmd.set_enclave_provider(provider);
    cmd.parameters_mut().unwrap().push(
        Parameter::new("@v", SqlType::NVarChar)
            .with_size(20)
            .with_value(WireValue::String("secret".into())),
    );

    let error = cmd.execute_non_query().await.unwrap_err();
    assert!(matches!(
        error,
        Error::Keys(mssql_keys::KeyError::SignatureVerificationFailed(_))
    ));
    // Nothing was written after the describe exchange.
    assert_eq!(connection.request_count(), 1);
}
