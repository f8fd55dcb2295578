//! Stratum v1 mining protocol server.
//!
//! The protocol is JSON-RPC over TCP with newline-delimited messages.
//!
//! # Protocol Overview
//!
//! Stratum v1 is a bidirectional, event-driven protocol:
//!
//! - **Client requests**: subscribe, authorize, submit,
//!   extranonce.subscribe
//! - **Server notifications**: mining.notify (new work),
//!   mining.set_difficulty, mining.set_extranonce
//! - **Server responses**: results for client requests (boolean, the
//!   subscribe tuple, or a `[code, message, data]` error array)
//!
//! # Architecture
//!
//! The server is a set of async tasks connected by channels: an accept
//! loop that also fans out job events, plus one session task per
//! connection owning that connection's protocol state. Sessions pull
//! shared services (job store, proof verifier, vardiff settings) from a
//! [`SessionContext`].

pub mod client;
pub mod connection;
pub mod error;
pub mod messages;
pub mod server;

pub use client::{ClientSession, SessionContext, ShareEvent};
pub use connection::{Connection, Transport};
pub use error::{SessionError, StratumError};
pub use messages::{ClientRequest, JsonRpcMessage, SubmitParams};
pub use server::{ServerError, StratumServer};
