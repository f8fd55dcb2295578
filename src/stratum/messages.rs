//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Defines the wire format for the server side of the protocol: the
//! JSON-RPC envelope, typed client requests with a dispatcher keyed on the
//! method name, and builders for the notifications the server pushes.
//!
//! ## Why not use a JSON-RPC library?
//!
//! Stratum v1 predates JSON-RPC 2.0 and uses non-standard conventions:
//! notifications carry `id: null` instead of omitting the field, errors are
//! a bare `[code, message, data]` array, and there is no version field.
//! Standard libraries expect spec compliance; this lightweight custom type
//! fits Stratum's quirks exactly without adapter layers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::StratumError;
use crate::job::Job;
use crate::u256::U256;

/// JSON-RPC message envelope.
///
/// Miners send ids as numbers or strings; the server never interprets
/// them beyond echoing, so ids stay as raw JSON values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        /// Message ID (null for notifications)
        id: Value,
        /// Method name (e.g., "mining.subscribe")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: Value,
        /// Result value (present on success)
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value (present on failure)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a notification (request with null id).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Value::Null,
            method: method.into(),
            params,
        }
    }

    /// Successful response echoing the request id.
    pub fn ok(id: Value, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: Some(Value::Null),
        }
    }

    /// Error response echoing the request id.
    pub fn err(id: Value, error: &StratumError) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(Value::Null),
            error: Some(error.to_wire()),
        }
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// A parsed, validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// `mining.subscribe [userAgent?]`
    Subscribe { user_agent: Option<String> },

    /// `mining.authorize [workerName, password]`
    Authorize { worker: String, password: String },

    /// `mining.submit [workerName, jobId, nonce, headerHash, mixHash]`
    Submit(SubmitParams),

    /// `mining.extranonce.subscribe []`
    ExtranonceSubscribe,
}

/// Raw `mining.submit` parameters, still hex-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub nonce_hex: String,
    pub header_hash_hex: String,
    pub mix_hash_hex: String,
}

impl ClientRequest {
    /// Dispatch on the method name and validate parameter shapes.
    ///
    /// Manual parsing for better error context than serde tuple structs.
    pub fn parse(method: &str, params: &Value) -> Result<Self, StratumError> {
        match method {
            "mining.subscribe" => {
                let user_agent = params
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ClientRequest::Subscribe { user_agent })
            }

            "mining.authorize" => {
                let arr = params
                    .as_array()
                    .ok_or_else(|| StratumError::Other("authorize params not an array".into()))?;
                let worker = arr
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| StratumError::Other("worker name missing".into()))?
                    .to_string();
                let password = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ClientRequest::Authorize { worker, password })
            }

            "mining.submit" => {
                let arr = params
                    .as_array()
                    .ok_or_else(|| StratumError::Other("submit params not an array".into()))?;
                if arr.len() < 5 {
                    return Err(StratumError::Other("submit params too short".into()));
                }
                let field = |idx: usize, name: &str| -> Result<String, StratumError> {
                    arr[idx]
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| StratumError::Other(format!("{} not a string", name)))
                };
                Ok(ClientRequest::Submit(SubmitParams {
                    worker: field(0, "worker")?,
                    job_id: field(1, "job id")?,
                    nonce_hex: field(2, "nonce")?,
                    header_hash_hex: field(3, "header hash")?,
                    mix_hash_hex: field(4, "mix hash")?,
                }))
            }

            "mining.extranonce.subscribe" => Ok(ClientRequest::ExtranonceSubscribe),

            other => Err(StratumError::MethodNotFound(other.to_string())),
        }
    }
}

/// `mining.subscribe` result in the full canonical form:
/// `[[[set_difficulty, subId], [notify, subId]], extranonce1, extranonce2Size]`.
pub fn subscribe_result(subscription_id: &str, extranonce1_hex: &str, extranonce2_size: usize) -> Value {
    json!([
        [
            ["mining.set_difficulty", subscription_id],
            ["mining.notify", subscription_id],
        ],
        extranonce1_hex,
        extranonce2_size,
    ])
}

/// `mining.set_difficulty` notification.
pub fn set_difficulty(difficulty: f64) -> JsonRpcMessage {
    JsonRpcMessage::notification("mining.set_difficulty", json!([difficulty]))
}

/// `mining.set_extranonce` notification, sent once after subscribe.
pub fn set_extranonce(extranonce1_hex: &str, extranonce2_size: usize) -> JsonRpcMessage {
    JsonRpcMessage::notification(
        "mining.set_extranonce",
        json!([extranonce1_hex, extranonce2_size]),
    )
}

/// `mining.notify` notification, KawPoW profile.
///
/// `target` is the client's share target derived from its current
/// difficulty, not the network target.
pub fn notify(job: &Job, target: U256, clean_jobs: bool) -> JsonRpcMessage {
    JsonRpcMessage::notification(
        "mining.notify",
        json!([
            job.id.to_string(),
            job.header_hash_hex(),
            job.seed_hash_hex(),
            target.to_hex(),
            clean_jobs,
        ]),
    )
}
