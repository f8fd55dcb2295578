//! Upstream RPC response types.
//!
//! Serde mirrors of the daemon's JSON shapes, limited to the fields this
//! server consumes. Field names follow the upstream's lowercase style via
//! rename attributes where they collide with Rust conventions.

use serde::Deserialize;

/// `getblocktemplate` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplate {
    pub height: u64,
    pub previousblockhash: String,

    /// Block version for the assembled header.
    pub version: u32,

    /// Compact network target.
    pub bits: String,

    pub curtime: u32,

    #[serde(default)]
    pub mintime: u32,

    pub coinbasevalue: u64,

    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,

    /// Witness commitment script for the coinbase, when segwit applies.
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

/// One mempool transaction included in a template.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction hex.
    pub data: String,

    /// Transaction id (display order hex).
    pub txid: String,

    #[serde(default)]
    pub fee: Option<i64>,
}

/// `getblockchaininfo` response (liveness probe).
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,

    #[serde(default)]
    pub headers: u64,

    pub bestblockhash: String,

    /// May arrive as a literal `nan` from some daemons; the transport
    /// rewrites that to 0 before parsing.
    #[serde(default)]
    pub difficulty: f64,

    #[serde(default)]
    pub initialblockdownload: bool,
}

/// `getblock` response (post-submit confirmation).
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlock {
    pub hash: String,

    #[serde(default)]
    pub confirmations: i64,

    pub height: u64,

    #[serde(default)]
    pub tx: Vec<String>,
}

/// `validateaddress` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAddress {
    pub isvalid: bool,

    #[serde(default)]
    pub address: Option<String>,

    /// Payment script for the address; the coinbase output uses it as-is.
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: Option<String>,
}
