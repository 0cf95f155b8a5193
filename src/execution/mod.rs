//! Execution-layer JSON-RPC client.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ExecutionConfig;

/// Latest block header fields used by the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
}

/// Callback type for recording execution request metrics.
/// Receives (method, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Execution client trait.
pub trait ExecutionClient: Send + Sync {
    /// Fetch the latest block header.
    fn latest_header(&self) -> impl std::future::Future<Output = Result<BlockHeader>> + Send;
}

/// HTTP JSON-RPC execution client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new execution client.
    pub fn new(cfg: &ExecutionConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, method: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(method, status, duration);
        }
    }

    /// Issue a JSON-RPC call and return its `result`.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let start = Instant::now();
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let result = self.send(method, &body).await;
        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request(method, status, start.elapsed());

        result
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .with_context(|| format!("calling {method}"))?;

        let status_code = response.status();
        if !status_code.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("unexpected status {} from {}: {}", status_code, method, text);
        }

        let envelope: RpcResponse<T> = response
            .json()
            .await
            .with_context(|| format!("decoding {method} response"))?;

        if let Some(err) = envelope.error {
            bail!("{} failed: {} (code {})", method, err.message, err.code);
        }

        envelope
            .result
            .with_context(|| format!("{method} returned no result"))
    }
}

// --- JSON-RPC structures ---

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcBlock {
    number: String,
    hash: String,
}

impl ExecutionClient for Client {
    async fn latest_header(&self) -> Result<BlockHeader> {
        debug!("fetching latest block header");

        let block: RpcBlock = self
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await
            .context("fetching latest block header")?;

        Ok(BlockHeader {
            number: parse_quantity(&block.number)?,
            hash: block.hash,
        })
    }
}

/// Parse a 0x-prefixed hex quantity.
fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw
        .strip_prefix("0x")
        .with_context(|| format!("quantity {raw:?} is missing 0x prefix"))?;

    u64::from_str_radix(digits, 16).with_context(|| format!("parsing quantity {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").expect("zero"), 0);
        assert_eq!(parse_quantity("0x121eac0").expect("block"), 19_000_000);
    }

    #[test]
    fn test_parse_quantity_rejects_decimal() {
        let err = parse_quantity("19000000").unwrap_err();
        assert!(err.to_string().contains("0x prefix"));
    }

    #[test]
    fn test_decode_block_response() {
        let resp: RpcResponse<RpcBlock> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "number": "0x10", "hash": "0xabc", "timestamp": "0x1" }
        }))
        .expect("should decode");

        let block = resp.result.expect("result");
        assert_eq!(block.number, "0x10");
        assert_eq!(block.hash, "0xabc");
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_decode_error_response() {
        let resp: RpcResponse<RpcBlock> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "header not found" }
        }))
        .expect("should decode");

        assert!(resp.result.is_none());
        let err = resp.error.expect("error");
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "header not found");
    }
}
