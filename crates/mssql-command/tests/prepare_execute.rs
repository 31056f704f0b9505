//! Prepare/execute lifecycle against the mock wire layer.

use mssql_command::{Command, Parameter, PrepareState};
use mssql_testing::{responses, MockConnection, WrittenRequest};
use tds_rpc::{ProcId, SqlType, SystemParam, TokenEvent, WireValue};

fn prepexec_or_execute(request: &WrittenRequest) -> Vec<TokenEvent> {
    match request.rpc().proc_id() {
        Some(ProcId::PrepExec) => {
            let mut events = vec![responses::prepare_handle(7)];
            events.extend(responses::scalar_int(5));
            events
        }
        Some(ProcId::Execute) => responses::scalar_int(5),
        other => panic!("unexpected shape: {other:?}"),
    }
}

fn select_x_command(connection: &std::sync::Arc<MockConnection>, text: &str) -> Command {
    let mut cmd = Command::text(text);
    cmd.set_connection(connection.clone()).unwrap();
    cmd.parameters_mut()
        .unwrap()
        .push(Parameter::new("@x", SqlType::Int).with_value(WireValue::Int(5)));
    cmd
}

fn handle_of(request: &WrittenRequest) -> i32 {
    match &request.rpc().system_params[0] {
        SystemParam::IntByRef { name: "@handle", value } | SystemParam::Int { name: "@handle", value } => {
            *value
        }
        other => panic!("first system param is not a handle: {other:?}"),
    }
}

#[tokio::test]
async fn test_prepare_execute_reuse() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- reuse");

    cmd.prepare().unwrap();
    assert_eq!(
        *cmd.prepare_state(),
        PrepareState::PreparePending {
            reusable_handle: None
        }
    );

    for _ in 0..3 {
        assert_eq!(cmd.execute_scalar().await.unwrap(), WireValue::Int(5));
    }

    // One prepexec (handle -1), then two executes reusing handle 7.
    let requests = connection.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].rpc().proc_id(), Some(ProcId::PrepExec));
    assert_eq!(handle_of(&requests[0]), -1);
    assert_eq!(requests[1].rpc().proc_id(), Some(ProcId::Execute));
    assert_eq!(handle_of(&requests[1]), 7);
    assert_eq!(requests[2].rpc().proc_id(), Some(ProcId::Execute));
    assert_eq!(cmd.prepare_state().handle(), Some(7));
}

#[tokio::test]
async fn test_prepare_is_idempotent() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- idempotent");

    cmd.prepare().unwrap();
    cmd.prepare().unwrap();
    cmd.execute_scalar().await.unwrap();
    cmd.prepare().unwrap();
    cmd.execute_scalar().await.unwrap();

    // Two prepares with no mutation between them: one prepexec total.
    let prepexec_count = connection
        .requests()
        .iter()
        .filter(|r| r.rpc().proc_id() == Some(ProcId::PrepExec))
        .count();
    assert_eq!(prepexec_count, 1);
}

#[tokio::test]
async fn test_dirty_reprepares_with_reused_handle() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- dirty");

    cmd.prepare().unwrap();
    cmd.execute_scalar().await.unwrap();
    assert!(cmd.prepare_state().is_prepared());

    // Grow the parameter: the shape changed, the plan is stale, but the
    // close count did not advance so the handle is reused.
    cmd.parameters_mut().unwrap().get_mut(0).unwrap().size = 8;
    cmd.execute_scalar().await.unwrap();

    let requests = connection.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].rpc().proc_id(), Some(ProcId::PrepExec));
    assert_eq!(handle_of(&requests[1]), 7);
}

#[tokio::test]
async fn test_close_count_invalidates_handle() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- close count");

    cmd.prepare().unwrap();
    cmd.execute_scalar().await.unwrap();

    // A pool close/reopen: the server-side handle is gone.
    connection.bump_close_count();
    cmd.parameters_mut().unwrap().get_mut(0).unwrap().size = 8;
    cmd.execute_scalar().await.unwrap();

    let requests = connection.requests();
    assert_eq!(requests[1].rpc().proc_id(), Some(ProcId::PrepExec));
    assert_eq!(handle_of(&requests[1]), -1);
}

#[tokio::test]
async fn test_text_mutation_unprepares() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- text a");

    cmd.prepare().unwrap();
    cmd.execute_scalar().await.unwrap();
    cmd.set_text("SELECT @x -- text b").unwrap();
    assert!(!cmd.prepare_state().is_prepared());
    cmd.execute_scalar().await.unwrap();

    let requests = connection.requests();
    assert_eq!(requests[1].rpc().proc_id(), Some(ProcId::PrepExec));
}

#[tokio::test]
async fn test_prepare_noop_for_stored_procedure_and_parameterless_text() {
    let connection = MockConnection::builder()
        .respond(|_| responses::done(0))
        .build();

    let mut proc = Command::stored_procedure("dbo.usp_x");
    proc.set_connection(connection.clone()).unwrap();
    proc.prepare().unwrap();
    assert_eq!(*proc.prepare_state(), PrepareState::Unprepared);

    let mut text = Command::text("SELECT 1");
    text.set_connection(connection.clone()).unwrap();
    text.prepare().unwrap();
    assert_eq!(*text.prepare_state(), PrepareState::Unprepared);

    // Parameterless text goes out as a raw batch, not an RPC.
    text.execute_non_query().await.unwrap();
    assert!(matches!(
        connection.requests()[0],
        WrittenRequest::Batch { .. }
    ));
}

#[tokio::test]
async fn test_set_connection_resets_prepare() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- reconnect");
    cmd.prepare().unwrap();
    cmd.execute_scalar().await.unwrap();
    assert!(cmd.prepare_state().is_prepared());

    let other = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    cmd.set_connection(other).unwrap();
    assert_eq!(*cmd.prepare_state(), PrepareState::Unprepared);
}

#[tokio::test]
async fn test_sessions_balanced_across_executions() {
    let connection = MockConnection::builder()
        .respond(prepexec_or_execute)
        .build();
    let mut cmd = select_x_command(&connection, "SELECT @x -- balance");
    cmd.prepare().unwrap();
    for _ in 0..3 {
        cmd.execute_scalar().await.unwrap();
    }
    assert_eq!(connection.sessions_acquired(), 3);
    assert_eq!(connection.sessions_returned(), 3);
}
