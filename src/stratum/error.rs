//! Error types for the Stratum v1 server.

use thiserror::Error;

/// Domain errors answered to the miner on the wire.
///
/// Stratum encodes these as a `[code, message, null]` array in the response
/// `error` field. Codes 20 through 24 are the conventional reserved set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StratumError {
    /// Catch-all code 20: malformed fields, wrong-job binding, bad proof.
    #[error("{0}")]
    Other(String),

    /// Code 21: the referenced job is unknown or evicted (stale).
    #[error("Job not found")]
    JobNotFound,

    /// Code 22: this (nonce, extranonce1) pair was already submitted.
    #[error("Duplicate share")]
    DuplicateShare,

    /// Code 23: the share's hash does not meet the miner's difficulty.
    #[error("Low difficulty share")]
    LowDifficulty,

    /// Code 24: submit before subscribe+authorize, or bad credentials.
    #[error("Unauthorized worker")]
    Unauthorized,

    /// Code 20, kept distinct for logging: unknown stratum method.
    #[error("Method not found: {0}")]
    MethodNotFound(String),
}

impl StratumError {
    /// Wire error code.
    pub fn code(&self) -> i64 {
        match self {
            StratumError::Other(_) | StratumError::MethodNotFound(_) => 20,
            StratumError::JobNotFound => 21,
            StratumError::DuplicateShare => 22,
            StratumError::LowDifficulty => 23,
            StratumError::Unauthorized => 24,
        }
    }

    /// The `[code, message, null]` wire encoding.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!([self.code(), self.to_string(), null])
    }
}

/// Connection-level failures local to one client session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error on the write path
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line arrived that is not a JSON-RPC message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Peer closed the connection
    #[error("Connection closed")]
    Disconnected,

    /// No bytes received within the idle window
    #[error("Idle timeout")]
    IdleTimeout,

    /// Too many consecutive malformed lines
    #[error("Too many protocol violations")]
    TooManyViolations,
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(StratumError::Other("x".into()).code(), 20);
        assert_eq!(StratumError::JobNotFound.code(), 21);
        assert_eq!(StratumError::DuplicateShare.code(), 22);
        assert_eq!(StratumError::LowDifficulty.code(), 23);
        assert_eq!(StratumError::Unauthorized.code(), 24);
        assert_eq!(StratumError::MethodNotFound("x.y".into()).code(), 20);
    }

    #[test]
    fn test_wire_encoding_shape() {
        let wire = StratumError::DuplicateShare.to_wire();
        let arr = wire.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[0], 22);
        assert_eq!(arr[1], "Duplicate share");
        assert!(arr[2].is_null());
    }
}
