//! Solo-mining Stratum v1 server for KawPoW coins.
//!
//! The server accepts miner TCP connections, hands out mining jobs derived
//! from the upstream node's block templates, validates submitted shares,
//! submits winning shares as blocks, and adapts per-miner difficulty to a
//! stable share cadence.
//!
//! # Architecture
//!
//! Everything is a tokio task talking over channels:
//!
//! - [`job::JobManager`] polls the node for templates and publishes jobs.
//! - [`stratum::StratumServer`] owns the listener and fans jobs out; each
//!   accepted connection runs its own [`stratum::ClientSession`] task.
//! - [`share`] validates submissions against the originating job.
//! - [`vardiff`] retargets a client's difficulty from its share cadence.
//! - [`daemon::Daemon`] wires the pieces together and owns shutdown.

pub mod config;
pub mod daemon;
pub mod job;
pub mod node;
pub mod pow;
pub mod share;
pub mod stratum;
pub mod tracing;
pub mod u256;
pub mod vardiff;
