//! Minimal calculator server: `add`, `subtract`, `divide`, and a `version`
//! property, served over both HTTP batch and WebSocket.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use webcap_core::{RpcError, RpcTarget, Value};
use webcap_server::{Server, ServerConfig};

#[derive(Debug)]
struct Calculator;

fn number_arg(args: &[Value], index: usize) -> Result<f64, RpcError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| RpcError::bad_request(format!("argument {} must be a number", index)))
}

#[async_trait]
impl RpcTarget for Calculator {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "add" => Ok(Value::float(number_arg(&args, 0)? + number_arg(&args, 1)?)),
            "subtract" => Ok(Value::float(number_arg(&args, 0)? - number_arg(&args, 1)?)),
            "divide" => {
                let dividend = number_arg(&args, 0)?;
                let divisor = number_arg(&args, 1)?;
                if divisor == 0.0 {
                    return Err(RpcError::with_data(
                        webcap_core::ErrorCode::BadRequest,
                        "Division by zero",
                        serde_json::json!({"divisor": 0}),
                    ));
                }
                Ok(Value::float(dividend / divisor))
            }
            _ => Err(RpcError::not_found(format!("no method {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "version" => Ok(Value::from("webcap-calculator/1")),
            _ => Err(RpcError::not_found(format!("no property {}", property))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,webcap_core=debug".into()),
        )
        .init();

    let config = ServerConfig::default();
    info!(host = %config.host, port = config.port, "starting calculator server");
    let server = Server::new(config, Arc::new(Calculator));
    server.run().await?;
    Ok(())
}
