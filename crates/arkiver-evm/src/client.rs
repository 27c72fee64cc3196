//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! Implements [`RpcClient`] with `eth_blockNumber`, `eth_getLogs` and
//! `eth_getBlockByNumber`. Transport failures and HTTP 429/5xx responses are
//! retried with exponential backoff; JSON-RPC error objects are not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arkiver_core::error::ArkiverError;
use arkiver_core::rpc::RpcClient;
use arkiver_core::types::{parse_hex_u64, LogFilter, RawBlock, RawLog};

// ─── Retry policy ────────────────────────────────────────────────────────────

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let base_ms =
            self.initial_backoff.as_millis() as f64 * self.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.max_backoff.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ─── JSON-RPC wire types ─────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result, or the JSON-RPC error as [`ArkiverError::Rpc`].
    pub fn into_result(self, method: &str) -> Result<Value, ArkiverError> {
        if let Some(err) = self.error {
            return Err(ArkiverError::Rpc(format!(
                "{method}: JSON-RPC error {}: {}",
                err.code, err.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// `eth_getLogs` filter object for `filter`.
pub fn filter_params(filter: &LogFilter) -> Value {
    let mut obj = json!({
        "fromBlock": format!("{:#x}", filter.from_block),
        "toBlock": format!("{:#x}", filter.to_block),
    });
    if !filter.addresses.is_empty() {
        obj["address"] = json!(filter.addresses);
    }
    if !filter.topics.is_empty() {
        obj["topics"] = json!(filter.topics);
    }
    obj
}

// ─── Client ──────────────────────────────────────────────────────────────────

enum SendError {
    Retryable(String),
    Fatal(String),
}

/// HTTP JSON-RPC client with retry.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    retry: RetryConfig,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, ArkiverError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ArkiverError::Rpc(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            retry: config.retry,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, ArkiverError> {
        Self::new(url, HttpClientConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, SendError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| SendError::Retryable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = format!("HTTP {}: {body}", status.as_u16());
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                SendError::Retryable(msg)
            } else {
                SendError::Fatal(msg)
            });
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| SendError::Fatal(format!("invalid response: {e}")))
    }

    /// Call `method`, retrying transient failures.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ArkiverError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => return resp.into_result(method),
                Err(SendError::Fatal(e)) => return Err(ArkiverError::Rpc(format!("{method}: {e}"))),
                Err(SendError::Retryable(e)) => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            method,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(attempt, error = %e, method, "max retries exceeded");
                        return Err(ArkiverError::Rpc(format!("{method}: {e}")));
                    }
                },
            }
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn get_block_number(&self) -> Result<u64, ArkiverError> {
        let result = self.call("eth_blockNumber", vec![]).await?;
        result
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| ArkiverError::Rpc(format!("eth_blockNumber: unexpected result {result}")))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ArkiverError> {
        let result = self.call("eth_getLogs", vec![filter_params(filter)]).await?;
        serde_json::from_value(result).map_err(|e| ArkiverError::Rpc(format!("eth_getLogs: {e}")))
    }

    async fn get_block(&self, number: u64) -> Result<Option<RawBlock>, ArkiverError> {
        let result = self
            .call("eth_getBlockByNumber", vec![json!(format!("{number:#x}")), json!(false)])
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        RawBlock::from_json(&result)
            .map(Some)
            .ok_or_else(|| ArkiverError::Rpc(format!("eth_getBlockByNumber: malformed block {number}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_grow_and_cap() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(retry.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(retry.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(retry.next_delay(3), Some(Duration::from_millis(300)));
        assert_eq!(retry.next_delay(6), None);
    }

    #[test]
    fn request_serializes_as_jsonrpc() {
        let req = JsonRpcRequest::new(7, "eth_blockNumber", vec![]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({"jsonrpc": "2.0", "method": "eth_blockNumber", "params": [], "id": 7})
        );
    }

    #[test]
    fn filter_params_omit_empty_addresses() {
        let filter = LogFilter {
            addresses: vec![],
            topics: vec![vec!["0xabc".into()]],
            from_block: 100,
            to_block: 150,
        };
        let v = filter_params(&filter);
        assert_eq!(v["fromBlock"], "0x64");
        assert_eq!(v["toBlock"], "0x96");
        assert!(v.get("address").is_none());
        assert_eq!(v["topics"], json!([["0xabc"]]));
    }

    #[test]
    fn error_response_is_rpc_error() {
        let resp: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32005, "message": "query returned more than 10000 results"}
        }))
        .unwrap();
        let err = resp.into_result("eth_getLogs").unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("-32005"));
    }

    #[test]
    fn client_builds_without_network() {
        let client = HttpRpcClient::default_for("http://localhost:8545").unwrap();
        assert_eq!(client.url(), "http://localhost:8545");
    }
}
