//! Shared utilities for talking to Ethereum JSON-RPC endpoints.

use std::time::Duration;

use anyhow::Context;
use derive_more::{Display, Error};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

/// Default timeout for a single RPC request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between polling attempts when waiting for readiness.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client(timeout: Duration) -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// Why a JSON-RPC call failed.
#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum RpcCallError {
    /// The request never produced a usable response.
    #[display("{method}: {message}")]
    Transport { method: String, message: String },
    /// The node answered with a JSON-RPC error object.
    #[display("{method}: RPC error {code}: {message}")]
    Node {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcCallError> {
    let transport = |message: String| RpcCallError::Transport {
        method: method.to_string(),
        message,
    };

    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| transport(format!("failed to send request: {e}")))?;

    let mut result: Value = response
        .json()
        .await
        .map_err(|e| transport(format!("failed to parse response: {e}")))?;

    if let Some(error) = result.get("error") {
        let error: ErrorObject = serde_json::from_value(error.clone())
            .map_err(|e| transport(format!("malformed error object: {e}")))?;
        return Err(RpcCallError::Node {
            method: method.to_string(),
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }

    let result_value = result
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| transport("no result in response".to_string()))?;

    serde_json::from_value(result_value)
        .map_err(|e| transport(format!("failed to deserialize result: {e}")))
}

/// Wait for a service to be ready by repeatedly calling a check function.
///
/// # Arguments
/// * `name` - Name of the service (for error messages)
/// * `timeout_secs` - Maximum time to wait in seconds
/// * `check_fn` - Function that returns Ok(()) when the service is ready
pub async fn wait_until_ready<F, Fut>(
    name: &str,
    timeout_secs: u64,
    check_fn: F,
) -> Result<(), anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>>,
{
    let start = std::time::Instant::now();
    let max_duration = Duration::from_secs(timeout_secs);

    loop {
        match check_fn().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::trace!(error = %e, service = %name, "Readiness check failed, retrying...");
                if start.elapsed() > max_duration {
                    return Err(e.context(format!("Timeout waiting for {name} to be ready")));
                }
            }
        }

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> anyhow::Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .with_context(|| format!("expected 0x-prefixed quantity, got `{s}`"))?;
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity `{s}`"))
}

/// Deserialize a u64 from a hex string (with 0x prefix).
pub fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(|e| serde::de::Error::custom(format!("{e:#}")))
}
