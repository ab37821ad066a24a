//! End-to-end session scenarios over an in-memory transport pair.

mod common;

use common::{pair, service};
use std::sync::Arc;
use webcap_core::{path, ErrorCode, RpcError, RpcSession, RpcTarget, SessionState, Value};

fn connect() -> (RpcSession, RpcSession) {
    let (client_end, server_end) = pair();
    let server = RpcSession::new(Box::new(server_end), Some(service()));
    let client = RpcSession::new(Box::new(client_end), None);
    (client, server)
}

#[tokio::test]
async fn simple_call_resolves() {
    let (client, _server) = connect();
    let root = client.root_stub();

    let promise = root.call(path(["add"]), vec![Value::int(5), Value::int(3)]);
    assert_eq!(promise.await_value().await.unwrap(), Value::int(8));
}

#[tokio::test]
async fn error_carries_code_and_data() {
    let (client, _server) = connect();
    let root = client.root_stub();

    let promise = root.call(path(["divide"]), vec![Value::int(10), Value::int(0)]);
    let err = promise.await_value().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);
    assert_eq!(err.message, "Division by zero");
    assert_eq!(err.data.unwrap()["divisor"], 0);
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let (client, _server) = connect();
    let root = client.root_stub();

    let err = root
        .call(path(["frobnicate"]), vec![])
        .await_value()
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn pipelined_navigation_without_await() {
    let (client, _server) = connect();
    let root = client.root_stub();

    // get() sends nothing; the dependent call flows in one direction only.
    let user = root.call(path(["authenticate"]), vec![Value::from("cookie-123")]);
    let profile = root.call(
        path(["getUserProfile"]),
        vec![Value::Promise(user.get(path(["id"])))],
    );

    let profile = profile.await_value().await.unwrap();
    assert_eq!(
        profile.navigate(&path(["bio"])).unwrap(),
        &Value::from("Countess of Lovelace")
    );
}

#[tokio::test]
async fn property_get_resolves() {
    let (client, _server) = connect();
    let root = client.root_stub();

    let version = root.get(path(["version"]));
    assert_eq!(
        version.await_value().await.unwrap(),
        Value::from("test-service/1")
    );
}

#[tokio::test]
async fn capability_passed_as_argument_is_called_back() {
    #[derive(Debug)]
    struct Tripler;

    #[async_trait::async_trait]
    impl RpcTarget for Tripler {
        async fn call(&self, _method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
            Ok(Value::int(args[0].as_i64().unwrap_or(0) * 3))
        }

        async fn get_property(&self, p: &str) -> Result<Value, RpcError> {
            Err(RpcError::not_found(p.to_string()))
        }
    }

    let (client, _server) = connect();
    let root = client.root_stub();

    let callback = webcap_core::Stub::from_target(Arc::new(Tripler));
    let promise = root.call(
        path(["transform"]),
        vec![Value::Stub(callback), Value::int(14)],
    );
    assert_eq!(promise.await_value().await.unwrap(), Value::int(42));
}

#[tokio::test]
async fn concurrent_calls_both_resolve() {
    let (client, _server) = connect();
    let root = client.root_stub();

    let first = root.call(path(["add"]), vec![Value::int(1), Value::int(2)]);
    let second = root.call(path(["add"]), vec![Value::int(30), Value::int(40)]);

    let (a, b) = tokio::join!(first.await_value(), second.await_value());
    assert_eq!(a.unwrap(), Value::int(3));
    assert_eq!(b.unwrap(), Value::int(70));
}

#[tokio::test]
async fn graceful_shutdown_closes_both_sides() {
    let (client, server) = connect();
    client.shutdown().await;
    assert_eq!(client.state(), SessionState::Closed);

    server.closed().await;
    assert_eq!(server.state(), SessionState::Closed);
}

#[tokio::test]
async fn calls_after_shutdown_fail_canceled() {
    let (client, _server) = connect();
    let root = client.root_stub();
    client.shutdown().await;

    let err = root
        .call(path(["add"]), vec![Value::int(1), Value::int(1)])
        .await_value()
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Canceled);
}

#[tokio::test]
async fn snapshot_round_trips_through_a_resume_token() {
    let (client, _server) = connect();
    let root = client.root_stub();
    let promise = root.call(path(["add"]), vec![Value::int(2), Value::int(2)]);
    promise.await_value().await.unwrap();

    let snapshot = webcap_core::SessionSnapshot::capture(&client, "sess-test");
    assert!(snapshot.next_positive_id >= 2);
    assert!(snapshot.imports.iter().any(|i| i.id == 0));
    assert!(snapshot.imports.iter().any(|i| i.id == 1));

    let manager =
        webcap_core::ResumeTokenManager::new(webcap_core::ResumeTokenManager::generate_secret_key());
    let token = manager.issue(&snapshot).unwrap();
    let restored = manager.redeem(&token).unwrap();
    assert_eq!(restored, snapshot);

    // A resumed session continues the ID sequence instead of reusing IDs.
    let (fresh_end, _peer_end) = pair();
    let resumed = webcap_core::RpcSession::resume(
        Box::new(fresh_end),
        None,
        &restored,
        webcap_core::SessionConfig::default(),
    );
    let next = webcap_core::SessionSnapshot::capture(&resumed, "sess-test");
    assert_eq!(next.next_positive_id, snapshot.next_positive_id);
    assert!(next.imports.iter().any(|i| i.id == 1));
}

#[tokio::test]
async fn abort_fails_outstanding_promises() {
    #[derive(Debug)]
    struct Stall;

    #[async_trait::async_trait]
    impl RpcTarget for Stall {
        async fn call(&self, _m: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
            // Never completes within the test.
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            Ok(Value::Null)
        }

        async fn get_property(&self, p: &str) -> Result<Value, RpcError> {
            Err(RpcError::not_found(p.to_string()))
        }
    }

    let (client_end, server_end) = pair();
    let _server = RpcSession::new(Box::new(server_end), Some(Arc::new(Stall)));
    let client = RpcSession::new(Box::new(client_end), None);

    let root = client.root_stub();
    let pending = root.call(path(["hang"]), vec![]);

    let waiter = tokio::spawn(async move { pending.await_value().await });
    tokio::task::yield_now().await;
    client.abort(RpcError::internal("giving up"));

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);
}
