//! Upstream node JSON-RPC client.
//!
//! Speaks JSON-RPC 1.0 over HTTP POST with basic auth, the way coin daemons
//! descended from Bitcoin Core do. The transport layer owns the retry
//! policy: transport failures (refused, reset, timeout, unreachable) retry
//! up to the configured attempts; HTTP auth rejections and RPC-level errors
//! never retry.
//!
//! Some daemons emit bare `nan` / `-nan` literals in numeric fields, which
//! is not JSON. [`fix_nan_literals`] rewrites those to `0` before parsing.

pub mod types;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::RpcConfig;
use crate::tracing::prelude::*;
use types::{BlockchainInfo, GetBlock, GetBlockTemplate, ValidateAddress};

/// Errors talking to the upstream node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Connection-level failure: refused, reset, DNS, timeout. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 401/403. Never retried; credentials will not fix themselves.
    #[error("upstream rejected credentials (HTTP {0})")]
    Auth(u16),

    /// Any other non-success HTTP status.
    #[error("upstream returned HTTP {0}")]
    Status(u16),

    /// The daemon answered with an RPC-level error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response body did not parse as the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Envelope carried neither result nor error.
    #[error("response missing result")]
    MissingResult,
}

impl NodeError {
    /// Whether the retry policy applies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Transport(_))
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

/// JSON-RPC 1.0 response envelope.
#[derive(Debug, serde::Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, serde::Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// HTTP JSON-RPC client for the coin daemon.
pub struct NodeClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    retry_attempts: u32,
    retry_delay: Duration,
    next_id: AtomicU64,
}

impl NodeClient {
    /// Build a client from the RPC section of the config.
    pub fn new(config: &RpcConfig) -> NodeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            url: format!("http://{}:{}", config.host, config.port),
            user: config.user.clone(),
            password: config.password.clone(),
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            next_id: AtomicU64::new(1),
        })
    }

    /// Liveness probe.
    pub async fn get_blockchain_info(&self) -> NodeResult<BlockchainInfo> {
        self.call("getblockchaininfo", json!([])).await
    }

    /// Fetch a block template for job assembly.
    pub async fn get_block_template(&self) -> NodeResult<GetBlockTemplate> {
        let params = json!([{
            "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
            "rules": ["segwit"],
        }]);
        self.call("getblocktemplate", params).await
    }

    /// Submit a serialized block.
    ///
    /// A `null` result means the node accepted the block; a string result
    /// is the node's rejection reason.
    pub async fn submit_block(&self, block_hex: &str) -> NodeResult<Option<String>> {
        let result = self.call_value("submitblock", json!([block_hex])).await?;
        match result {
            Value::Null => Ok(None),
            Value::String(reason) => Ok(Some(reason)),
            other => Ok(Some(other.to_string())),
        }
    }

    /// Look a block up by hash, confirming a submission landed.
    pub async fn get_block(&self, hash: &str) -> NodeResult<GetBlock> {
        self.call("getblock", json!([hash])).await
    }

    /// Validate the coinbase address and fetch its payment script.
    pub async fn validate_address(&self, address: &str) -> NodeResult<ValidateAddress> {
        self.call("validateaddress", json!([address])).await
    }

    /// Typed call.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> NodeResult<T> {
        let result = self.call_value(method, params).await?;
        if result.is_null() {
            return Err(NodeError::MissingResult);
        }
        serde_json::from_value(result).map_err(|e| NodeError::Decode(e.to_string()))
    }

    /// Raw call returning the `result` value, with transport retries.
    async fn call_value(&self, method: &str, params: Value) -> NodeResult<Value> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, &params).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(
                        method,
                        attempt,
                        error = %e,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, method: &str, params: &Value) -> NodeResult<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        trace!(method, "Calling upstream");

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(NodeError::Auth(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        // Daemons answer some RPC errors with non-200 plus a JSON body;
        // prefer the body's error over the bare status when present.
        let fixed = fix_nan_literals(&text);
        let envelope: RpcEnvelope = match serde_json::from_str(&fixed) {
            Ok(env) => env,
            Err(e) => {
                if !status.is_success() {
                    return Err(NodeError::Status(status.as_u16()));
                }
                return Err(NodeError::Decode(e.to_string()));
            }
        };

        if let Some(err) = envelope.error {
            return Err(NodeError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        if !status.is_success() {
            return Err(NodeError::Status(status.as_u16()));
        }
        Ok(envelope.result)
    }
}

/// Rewrite bare `nan` / `-nan` value literals to `0`.
///
/// Only the value position is touched: the literal must directly follow a
/// `:` and run up to a `,` or `}`. String contents never match because a
/// string value starts with a quote after the colon.
pub fn fix_nan_literals(text: &str) -> String {
    text.replace(":-nan,", ":0,")
        .replace(":-nan}", ":0}")
        .replace(":nan,", ":0,")
        .replace(":nan}", ":0}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_fix_nan_literals() {
        let raw = r#"{"difficulty":nan,"verificationprogress":-nan}"#;
        let fixed = fix_nan_literals(raw);
        assert_eq!(fixed, r#"{"difficulty":0,"verificationprogress":0}"#);

        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["difficulty"], 0);
    }

    #[test]
    fn test_fix_nan_leaves_plain_strings_alone() {
        // A string value starts with a quote after the colon, so the
        // rewrite never fires on ordinary string content.
        let clean = r#"{"note":"nan","other":"-nan"}"#;
        assert_eq!(fix_nan_literals(clean), clean);
    }

    #[test]
    fn test_envelope_with_error() {
        let body = r#"{"result":null,"error":{"code":-32601,"message":"Method not found"},"id":1}"#;
        let envelope: RpcEnvelope = serde_json::from_str(body).unwrap();
        let err = envelope.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }

    #[test]
    fn test_template_parses() {
        let body = r#"{
            "height": 123456,
            "previousblockhash": "aa00000000000000000000000000000000000000000000000000000000000001",
            "version": 805306368,
            "bits": "1d00ffff",
            "curtime": 1700000000,
            "mintime": 1699999000,
            "coinbasevalue": 250000000000,
            "transactions": [
                {"data": "01000000", "txid": "bb00000000000000000000000000000000000000000000000000000000000002"}
            ],
            "default_witness_commitment": "6a24aa21a9ed0000000000000000000000000000000000000000000000000000000000000000"
        }"#;
        let template: GetBlockTemplate = serde_json::from_str(body).unwrap();
        assert_eq!(template.height, 123_456);
        assert_eq!(template.transactions.len(), 1);
        assert!(template.default_witness_commitment.is_some());
    }

    /// Serve exactly one canned HTTP response on a local socket.
    async fn one_shot_http_server(body: &'static str, status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        addr.to_string()
    }

    fn test_config(addr: &str) -> RpcConfig {
        let (host, port) = addr.rsplit_once(':').unwrap();
        RpcConfig {
            host: host.to_string(),
            port: port.parse().unwrap(),
            user: "u".to_string(),
            password: "p".to_string(),
            timeout: 5,
            retry_attempts: 0,
            retry_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_call_parses_result_with_nan_fix() {
        let body = r#"{"result":{"chain":"main","blocks":10,"bestblockhash":"ab","difficulty":nan},"error":null,"id":1}"#;
        let addr = one_shot_http_server(body, "200 OK").await;

        let client = NodeClient::new(&test_config(&addr)).unwrap();
        let info = client.get_blockchain_info().await.unwrap();
        assert_eq!(info.chain, "main");
        assert_eq!(info.blocks, 10);
        assert_eq!(info.difficulty, 0.0);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_not_retried() {
        let addr = one_shot_http_server("", "401 Unauthorized").await;

        let mut config = test_config(&addr);
        config.retry_attempts = 5;
        let client = NodeClient::new(&config).unwrap();

        // A retry would hang on the dead listener; an immediate Auth error
        // proves the policy short-circuited.
        let err = client.get_blockchain_info().await.unwrap_err();
        assert!(matches!(err, NodeError::Auth(401)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces() {
        let body = r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#;
        let addr = one_shot_http_server(body, "500 Internal Server Error").await;

        let client = NodeClient::new(&test_config(&addr)).unwrap();
        let err = client.get_block("00").await.unwrap_err();
        match err {
            NodeError::Rpc { code, message } => {
                assert_eq!(code, -8);
                assert_eq!(message, "Block height out of range");
            }
            other => panic!("expected Rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_block_null_is_accepted() {
        let body = r#"{"result":null,"error":null,"id":1}"#;
        let addr = one_shot_http_server(body, "200 OK").await;

        let client = NodeClient::new(&test_config(&addr)).unwrap();
        let outcome = client.submit_block("00ff").await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_submit_block_string_is_rejection() {
        let body = r#"{"result":"high-hash","error":null,"id":1}"#;
        let addr = one_shot_http_server(body, "200 OK").await;

        let client = NodeClient::new(&test_config(&addr)).unwrap();
        let outcome = client.submit_block("00ff").await.unwrap();
        assert_eq!(outcome.as_deref(), Some("high-hash"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = NodeClient::new(&test_config(&addr)).unwrap();
        let err = client.get_blockchain_info().await.unwrap_err();
        assert!(err.is_retryable(), "got {:?}", err);
    }
}
