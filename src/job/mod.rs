//! Mining jobs: assembly from block templates and lifecycle management.
//!
//! A [`Job`] is an immutable snapshot of what to mine, derived from one
//! `getblocktemplate` response. The [`JobManager`] task keeps the current
//! job fresh and publishes transitions; the [`JobStore`] retains every job
//! still eligible for submissions.

pub mod assembly;
mod job;
mod manager;

pub use assembly::AssemblyError;
pub use job::{Job, JobId, JobStore};
pub use manager::{build_job, JobEvent, JobManager, ManagerCommand, UpstreamEvent};

use thiserror::Error;

/// Job acquisition and assembly errors.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("upstream: {0}")]
    Node(#[from] crate::node::NodeError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("template bits field invalid: {0}")]
    BadBits(String),
}

#[cfg(test)]
pub(crate) use job::testing;
