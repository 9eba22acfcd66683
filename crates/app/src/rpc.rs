use anyhow::{anyhow, Context, Result};
use dexquote_config::RpcConfig;
use reqwest::Client;
use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use std::str::FromStr;
use std::time::Duration;

/// Thin JSON-RPC client; the only chain read the service itself performs is
/// the recent blockhash used to finalize swap transactions.
pub struct RpcClient {
    http: Client,
    url: String,
}

impl RpcClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let url = config.http_url.trim();
        if url.is_empty() {
            return Err(anyhow!("rpc.http_url is required"));
        }
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(500)))
            .build()
            .context("failed building rpc http client")?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    pub async fn latest_blockhash(&self) -> Result<Hash> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getLatestBlockhash",
            "params": [{"commitment": "confirmed"}]
        });

        let response: Value = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("getLatestBlockhash POST failed via {}", self.url))?
            .error_for_status()
            .context("non-success getLatestBlockhash status")?
            .json()
            .await
            .context("failed parsing getLatestBlockhash json")?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("rpc error from getLatestBlockhash: {error}"));
        }

        let blockhash = response
            .pointer("/result/value/blockhash")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing blockhash in getLatestBlockhash response"))?;
        Hash::from_str(blockhash).context("invalid blockhash in rpc response")
    }
}
