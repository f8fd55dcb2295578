//! Configuration for the stratum server.
//!
//! Loaded from a TOML file; every field has a default except the upstream
//! node credentials and the coinbase payout address. Validation runs once at
//! startup and any violation is fatal.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::vardiff::VardiffConfig;

/// Configuration errors, all fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address paid by the coinbase outputs.
    pub coinbase_address: String,

    /// Text embedded in the coinbase input script.
    #[serde(default = "default_block_brand")]
    pub block_brand: String,

    /// Stratum listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream node RPC endpoint.
    pub rpc: RpcConfig,

    /// Same-block job refresh cadence, seconds.
    #[serde(default = "default_job_update_interval")]
    pub job_update_interval: u64,

    /// New-block poll cadence, milliseconds.
    #[serde(default = "default_block_poll_interval_ms")]
    pub block_poll_interval_ms: u64,

    /// Upstream liveness probes at startup before giving up.
    #[serde(default = "default_startup_retry_attempts")]
    pub startup_retry_attempts: u32,

    /// Delay between startup probes, seconds.
    #[serde(default = "default_startup_retry_delay")]
    pub startup_retry_delay: u64,

    /// Per-client difficulty retargeting.
    #[serde(default)]
    pub vardiff: VardiffConfig,

    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,

    /// Optional log file path (in addition to stdout/journald).
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Stratum listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port and initial difficulty.
    #[serde(default)]
    pub port: PortConfig,

    /// Seconds a connection may stay silent before being closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

/// Port settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortConfig {
    #[serde(default = "default_port")]
    pub number: u16,

    /// Initial per-client difficulty. When absent, the geometric mean of
    /// the vardiff bounds is used.
    #[serde(default)]
    pub diff: Option<f64>,
}

/// Upstream node RPC settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,

    /// Per-call timeout, seconds.
    #[serde(default = "default_rpc_timeout")]
    pub timeout: u64,

    /// Retries for transport-level failures.
    #[serde(default = "default_rpc_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between retries, milliseconds.
    #[serde(default = "default_rpc_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_block_brand() -> String {
    "/corvid-stratum/".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3333
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_job_update_interval() -> u64 {
    55
}

fn default_block_poll_interval_ms() -> u64 {
    250
}

fn default_startup_retry_attempts() -> u32 {
    10
}

fn default_startup_retry_delay() -> u64 {
    3
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_rpc_retry_attempts() -> u32 {
    2
}

fn default_rpc_retry_delay_ms() -> u64 {
    1_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: PortConfig::default(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            number: default_port(),
            diff: None,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coinbase_address.is_empty() {
            return Err(ConfigError::Invalid("coinbase_address is empty".into()));
        }
        if self.rpc.host.is_empty() {
            return Err(ConfigError::Invalid("rpc.host is empty".into()));
        }
        if self.block_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "block_poll_interval_ms must be positive".into(),
            ));
        }
        if self.job_update_interval == 0 {
            return Err(ConfigError::Invalid(
                "job_update_interval must be positive".into(),
            ));
        }
        self.vardiff
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(diff) = self.server.port.diff {
            if !diff.is_finite() || diff <= 0.0 {
                return Err(ConfigError::Invalid(
                    "server.port.diff must be a positive number".into(),
                ));
            }
        }
        Ok(())
    }

    /// RPC endpoint URL.
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.rpc.host, self.rpc.port)
    }

    /// Per-call RPC timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.timeout)
    }

    /// Stratum bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port.number)
    }
}
