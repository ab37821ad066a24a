//! Client bootstrap against an in-process server session.

use async_trait::async_trait;
use std::sync::Arc;
use webcap_client::{path, Client, Value};
use webcap_core::{RpcError, RpcSession, RpcTarget, SessionConfig};
use webcap_transport::memory_pair;

#[derive(Debug)]
struct Echo;

#[async_trait]
impl RpcTarget for Echo {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            "sum" => Ok(Value::int(
                args.iter().filter_map(Value::as_i64).sum::<i64>(),
            )),
            _ => Err(RpcError::not_found(format!("no method {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(property.to_string()))
    }
}

fn client_and_server() -> (Client, RpcSession) {
    let (client_end, server_end) = memory_pair();
    let server = RpcSession::new(Box::new(server_end), Some(Arc::new(Echo)));
    let client = Client::over(Box::new(client_end), None, SessionConfig::default());
    (client, server)
}

#[tokio::test]
async fn call_round_trips() {
    let (client, _server) = client_and_server();
    let value = client
        .call(path(["echo"]), vec![Value::from("hello")])
        .await
        .unwrap();
    assert_eq!(value, Value::from("hello"));
}

#[tokio::test]
async fn batch_flushes_dependent_calls() {
    let (client, _server) = client_and_server();
    let root = client.root();

    let batch = client.batch();
    let first = batch.call(&root, path(["sum"]), vec![Value::int(1), Value::int(2)]);
    let second = batch.call(
        &root,
        path(["sum"]),
        vec![Value::Promise(first.clone()), Value::int(10)],
    );
    batch.flush();

    assert_eq!(first.await_value().await.unwrap(), Value::int(3));
    assert_eq!(second.await_value().await.unwrap(), Value::int(13));
}

#[tokio::test]
async fn rpc_errors_surface_through_anyhow() {
    let (client, _server) = client_and_server();
    let err = client.call(path(["missing"]), vec![]).await.unwrap_err();
    let rpc = err.downcast::<RpcError>().unwrap();
    assert_eq!(rpc.code, webcap_core::ErrorCode::NotFound);
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let err = Client::connect("ftp://example.com/rpc").await.unwrap_err();
    assert!(err.to_string().contains("unsupported URL scheme"));
}
