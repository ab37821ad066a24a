//! Literal-frame conformance: drive one session with handwritten NDJSON
//! lines and assert the exact bytes it answers with.

mod common;

use common::{service, transport_with_raw_peer};
use serde_json::json;
use webcap_core::{path, Batch, RpcSession, SessionState, Value};

#[tokio::test]
async fn push_pull_resolves_with_literal_frames() {
    // S1: ["push", ["pipeline", 0, ["add"], [[5,3]]]] then ["pull", 1]
    // must come back as ["resolve", 1, 8].
    let (transport, mut peer) = transport_with_raw_peer();
    let _server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line(r#"["push",["pipeline",0,["add"],[[5,3]]]]"#);
    peer.send_line(r#"["pull",1]"#);

    assert_eq!(peer.recv_line().await, r#"["resolve",1,8]"#);
}

#[tokio::test]
async fn rejection_carries_error_tuple() {
    let (transport, mut peer) = transport_with_raw_peer();
    let _server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line(r#"["push",["pipeline",0,["divide"],[[10,0]]]]"#);
    peer.send_line(r#"["pull",1]"#);

    let frame = peer.recv_json().await;
    assert_eq!(frame[0], "reject");
    assert_eq!(frame[1], 1);
    assert_eq!(frame[2][0], "error");
    assert_eq!(frame[2][1], "bad_request");
    assert_eq!(frame[2][2], "Division by zero");
    // Stack slot is a null placeholder; data rides in position four.
    assert_eq!(frame[2][3], json!(null));
    assert_eq!(frame[2][4], json!({"divisor": 0}));
}

#[tokio::test]
async fn literal_array_results_are_escaped() {
    // S3: a plain array value travels double-wrapped.
    let (transport, mut peer) = transport_with_raw_peer();
    let _server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line(r#"["push",[["just","an","array"]]]"#);
    peer.send_line(r#"["pull",1]"#);

    assert_eq!(
        peer.recv_line().await,
        r#"["resolve",1,[["just","an","array"]]]"#
    );
}

#[tokio::test]
async fn pipelined_pushes_reference_earlier_results() {
    // S2-shaped flow against a literal transcript.
    let (transport, mut peer) = transport_with_raw_peer();
    let _server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line(r#"["push",["pipeline",0,["authenticate"],[["cookie-123"]]]]"#);
    peer.send_line(r#"["push",["pipeline",0,["getUserProfile"],[[["pipeline",1,["id"]]]]]]"#);
    peer.send_line(r#"["push",["pipeline",0,["getNotifications"],[[["pipeline",1,["id"]]]]]]"#);
    peer.send_line(r#"["pull",2]"#);
    peer.send_line(r#"["pull",3]"#);

    let mut resolved = std::collections::HashMap::new();
    for _ in 0..2 {
        let frame = peer.recv_json().await;
        assert_eq!(frame[0], "resolve");
        resolved.insert(frame[1].as_i64().unwrap(), frame[2].clone());
    }
    assert_eq!(resolved[&2], json!({"bio": "Countess of Lovelace"}));
    assert_eq!(resolved[&3], json!([["welcome!"]]));
}

#[tokio::test]
async fn unknown_message_aborts_with_bad_request() {
    let (transport, mut peer) = transport_with_raw_peer();
    let server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line(r#"["transmogrify",1]"#);

    let frame = peer.recv_json().await;
    assert_eq!(frame[0], "abort");
    assert_eq!(frame[1][0], "error");
    assert_eq!(frame[1][1], "bad_request");

    server.closed().await;
    assert_eq!(server.state(), SessionState::Closed);
}

#[tokio::test]
async fn malformed_json_aborts() {
    let (transport, mut peer) = transport_with_raw_peer();
    let _server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line("{not json");

    let frame = peer.recv_json().await;
    assert_eq!(frame[0], "abort");
    assert_eq!(frame[1][1], "bad_request");
}

#[tokio::test]
async fn oversized_frame_aborts() {
    let (transport, mut peer) = transport_with_raw_peer();
    let config = webcap_core::SessionConfig {
        max_frame_size: 64,
        ..Default::default()
    };
    let _server = RpcSession::with_config(Box::new(transport), Some(service()), config);

    let huge = format!(r#"["push",["pipeline",0,["add"],[[1,"{}"]]]]"#, "x".repeat(256));
    peer.send_line(&huge);

    let frame = peer.recv_json().await;
    assert_eq!(frame[0], "abort");
    assert_eq!(frame[1][1], "bad_request");
}

#[tokio::test]
async fn pull_of_unknown_export_rejects_not_found() {
    let (transport, mut peer) = transport_with_raw_peer();
    let _server = RpcSession::new(Box::new(transport), Some(service()));

    peer.send_line(r#"["pull",99]"#);

    let frame = peer.recv_json().await;
    assert_eq!(frame[0], "reject");
    assert_eq!(frame[1], 99);
    assert_eq!(frame[2][1], "not_found");
}

#[tokio::test]
async fn client_emits_sequential_pushes_then_pulls() {
    // The client side of S2, checked against the frames it actually writes.
    let (transport, mut peer) = transport_with_raw_peer();
    let client = RpcSession::new(Box::new(transport), None);
    let root = client.root_stub();

    let batch = Batch::new(&client);
    let user = batch.call(&root, path(["authenticate"]), vec![Value::from("cookie-123")]);
    let profile = batch.call(
        &root,
        path(["getUserProfile"]),
        vec![Value::Promise(user.get(path(["id"])))],
    );
    let notifications = batch.call(
        &root,
        path(["getNotifications"]),
        vec![Value::Promise(user.get(path(["id"])))],
    );
    batch.flush();

    let first = peer.recv_json().await;
    assert_eq!(
        first,
        json!(["push", ["pipeline", 0, ["authenticate"], [["cookie-123"]]]])
    );
    let second = peer.recv_json().await;
    assert_eq!(
        second,
        json!(["push", ["pipeline", 0, ["getUserProfile"], [[["pipeline", 1, ["id"]]]]]])
    );
    let third = peer.recv_json().await;
    assert_eq!(
        third,
        json!(["push", ["pipeline", 0, ["getNotifications"], [[["pipeline", 1, ["id"]]]]]])
    );
    for expected in 1..=3 {
        assert_eq!(peer.recv_json().await, json!(["pull", expected]));
    }

    // Resolutions may arrive in any order.
    peer.send_line(r#"["resolve",3,[["welcome!"]]]"#);
    peer.send_line(r#"["resolve",1,{"id":"u_1","name":"Ada"}]"#);
    peer.send_line(r#"["resolve",2,{"bio":"Countess of Lovelace"}]"#);

    assert_eq!(
        notifications.await_value().await.unwrap(),
        Value::Array(vec![Value::from("welcome!")])
    );
    assert_eq!(
        profile
            .await_value()
            .await
            .unwrap()
            .navigate(&path(["bio"]))
            .unwrap(),
        &Value::from("Countess of Lovelace")
    );
    assert_eq!(
        user.await_value()
            .await
            .unwrap()
            .navigate(&path(["name"]))
            .unwrap(),
        &Value::from("Ada")
    );
}

#[tokio::test]
async fn disposing_a_result_sends_release() {
    let (transport, mut peer) = transport_with_raw_peer();
    let client = RpcSession::new(Box::new(transport), None);
    let root = client.root_stub();

    let promise = root.call(path(["add"]), vec![Value::int(1), Value::int(2)]);
    assert_eq!(peer.recv_json().await[0], "push");

    promise.dispose();
    assert_eq!(peer.recv_json().await, json!(["release", 1, 1]));
}

#[tokio::test]
async fn canceled_batch_emits_nothing() {
    let (transport, mut peer) = transport_with_raw_peer();
    let client = RpcSession::new(Box::new(transport), None);
    let root = client.root_stub();

    let batch = Batch::new(&client);
    let pending = batch.call(&root, path(["add"]), vec![Value::int(1), Value::int(2)]);
    batch.cancel();

    let err = pending.await_value().await.unwrap_err();
    assert_eq!(err.code, webcap_core::ErrorCode::Canceled);

    // A subsequent direct call must use import ID 1: nothing was allocated
    // by the canceled batch.
    let promise = root.call(path(["add"]), vec![Value::int(1), Value::int(2)]);
    let frame = peer.recv_json().await;
    assert_eq!(frame[0], "push");
    peer.send_line(r#"["resolve",1,3]"#);
    assert_eq!(promise.await_value().await.unwrap(), Value::int(3));
}
