//! Job manager: template acquisition and job publication.
//!
//! One task owns the upstream template flow. It polls for new blocks every
//! `block_poll_interval_ms`, refreshes the current block's transactions
//! every `job_update_interval`, honors external block notifications, and
//! republishes immediately after a block submission so the chain advance
//! reaches miners without waiting for the next poll tick.
//!
//! All template applications happen sequentially inside this task, so two
//! in-flight templates can never publish out of order; the last response
//! applied wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::assembly;
use super::job::{Job, JobId, JobStore};
use super::JobError;
use crate::node::types::GetBlockTemplate;
use crate::node::NodeClient;
use crate::pow;
use crate::tracing::prelude::*;
use crate::u256::U256;

/// Consecutive template failures before the upstream is reported down.
const RPC_FAILURE_THRESHOLD: u32 = 5;

/// A job publication, fanned out to connected miners.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Arc<Job>,
    /// True on a new-block transition; miners must drop prior work.
    pub clean_jobs: bool,
}

/// Commands other tasks send the manager.
#[derive(Debug)]
pub enum ManagerCommand {
    /// A daemon hook (or operator) says a new block exists upstream.
    BlockNotify,

    /// A client found a block; submit it and surface the outcome.
    SubmitBlock {
        block_hex: String,
        block_hash: String,
        /// True when the node accepted the block.
        accepted: oneshot::Sender<bool>,
    },
}

/// Upstream availability transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEvent {
    Connected,
    Disconnected,
}

/// Owns the current job and the upstream template flow.
pub struct JobManager {
    node: Arc<NodeClient>,
    store: Arc<JobStore>,
    job_tx: mpsc::Sender<JobEvent>,
    upstream_tx: mpsc::Sender<UpstreamEvent>,
    command_rx: mpsc::Receiver<ManagerCommand>,
    shutdown: CancellationToken,

    payout_script: Vec<u8>,
    brand: Vec<u8>,
    poll_interval: Duration,
    refresh_interval: Duration,

    next_job_id: u32,
    consecutive_failures: u32,
    reported_down: bool,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: Arc<NodeClient>,
        store: Arc<JobStore>,
        job_tx: mpsc::Sender<JobEvent>,
        upstream_tx: mpsc::Sender<UpstreamEvent>,
        command_rx: mpsc::Receiver<ManagerCommand>,
        shutdown: CancellationToken,
        payout_script: Vec<u8>,
        brand: Vec<u8>,
        poll_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            node,
            store,
            job_tx,
            upstream_tx,
            command_rx,
            shutdown,
            payout_script,
            brand,
            poll_interval,
            refresh_interval,
            next_job_id: 1,
            consecutive_failures: 0,
            reported_down: false,
        }
    }

    /// Acquire the first template and publish the first job.
    ///
    /// Failure here is fatal to startup: a stratum server with no job has
    /// nothing to hand a miner.
    pub async fn init(&mut self) -> Result<(), JobError> {
        let template = self.node.get_block_template().await?;
        let job = self.build_job(&template)?;
        info!(
            height = job.height,
            job_id = %job.id,
            "Initial job assembled"
        );
        self.publish(job, true).await;
        Ok(())
    }

    /// Run until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut poll = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_for_block().await;
                }

                _ = refresh.tick() => {
                    self.refresh().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ManagerCommand::BlockNotify => {
                            debug!("Block notification received");
                            self.poll_for_block().await;
                        }
                        ManagerCommand::SubmitBlock { block_hex, block_hash, accepted } => {
                            let ok = self.submit_block(&block_hex, &block_hash).await;
                            let _ = accepted.send(ok);
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    debug!("Job manager shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn next_id(&mut self) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id = self.next_job_id.wrapping_add(1);
        id
    }

    fn build_job(&mut self, template: &GetBlockTemplate) -> Result<Job, JobError> {
        let id = self.next_id();
        build_job(id, template, &self.payout_script, &self.brand)
    }

    /// Fetch a template, tracking upstream availability.
    async fn fetch_template(&mut self) -> Option<GetBlockTemplate> {
        match self.node.get_block_template().await {
            Ok(template) => {
                if self.reported_down {
                    info!("Upstream node recovered");
                    let _ = self.upstream_tx.send(UpstreamEvent::Connected).await;
                    self.reported_down = false;
                }
                self.consecutive_failures = 0;
                Some(template)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    "Template fetch failed"
                );
                if self.consecutive_failures >= RPC_FAILURE_THRESHOLD && !self.reported_down {
                    error!("Upstream node unreachable, continuing to poll");
                    let _ = self.upstream_tx.send(UpstreamEvent::Disconnected).await;
                    self.reported_down = true;
                }
                None
            }
        }
    }

    /// New-block detection tick.
    async fn poll_for_block(&mut self) {
        let Some(template) = self.fetch_template().await else {
            return;
        };
        let current_prev = self.store.current().map(|job| job.prev_block_hash.clone());
        if current_prev.as_deref() == Some(template.previousblockhash.as_str()) {
            return;
        }

        match self.build_job(&template) {
            Ok(job) => {
                info!(
                    height = job.height,
                    job_id = %job.id,
                    prev = %job.prev_block_hash,
                    "New block, broadcasting fresh work"
                );
                self.publish(job, true).await;
            }
            Err(e) => error!(error = %e, "Failed to assemble job from template"),
        }
    }

    /// Same-block refresh tick, keeping mempool transactions current.
    async fn refresh(&mut self) {
        let Some(template) = self.fetch_template().await else {
            return;
        };
        let current = self.store.current();
        let new_block = match &current {
            Some(job) => job.prev_block_hash != template.previousblockhash,
            None => true,
        };

        match self.build_job(&template) {
            Ok(job) => {
                if !new_block {
                    if let Some(current) = &current {
                        if current.header_hash == job.header_hash {
                            debug!(job_id = %current.id, "Refresh produced identical work, suppressed");
                            return;
                        }
                    }
                }
                debug!(
                    height = job.height,
                    job_id = %job.id,
                    new_block,
                    "Refreshed job"
                );
                self.publish(job, new_block).await;
            }
            Err(e) => error!(error = %e, "Failed to assemble job from template"),
        }
    }

    async fn publish(&mut self, job: Job, clean_jobs: bool) {
        let job = Arc::new(job);
        self.store.publish(job.clone(), clean_jobs);
        if self.job_tx.send(JobEvent { job, clean_jobs }).await.is_err() {
            debug!("Job event channel closed");
        }
    }

    /// Submit a found block, surface the chain advance, confirm acceptance.
    async fn submit_block(&mut self, block_hex: &str, block_hash: &str) -> bool {
        let accepted = match self.node.submit_block(block_hex).await {
            Ok(None) => {
                info!(hash = %block_hash, "Block accepted by upstream node");
                true
            }
            Ok(Some(reason)) => {
                warn!(hash = %block_hash, reason = %reason, "Block rejected by upstream node");
                false
            }
            Err(e) => {
                error!(hash = %block_hash, error = %e, "Block submission failed");
                false
            }
        };

        // Surface the chain advance without waiting for the poll tick.
        self.poll_for_block().await;

        if accepted {
            match self.node.get_block(block_hash).await {
                Ok(block) => {
                    info!(
                        hash = %block.hash,
                        height = block.height,
                        confirmations = block.confirmations,
                        "Block confirmed on chain"
                    );
                }
                Err(e) => {
                    warn!(hash = %block_hash, error = %e, "Submitted block not yet visible upstream");
                }
            }
        }
        accepted
    }
}

/// Assemble a [`Job`] from a template.
pub fn build_job(
    id: JobId,
    template: &GetBlockTemplate,
    payout_script: &[u8],
    brand: &[u8],
) -> Result<Job, JobError> {
    let bits = u32::from_str_radix(&template.bits, 16)
        .map_err(|_| JobError::BadBits(template.bits.clone()))?;
    let network_target = U256::from_compact(bits);
    if network_target == U256::ZERO {
        return Err(JobError::BadBits(template.bits.clone()));
    }

    let prev_internal = assembly::decode_hash_internal("previousblockhash", &template.previousblockhash)?;

    let witness = template
        .default_witness_commitment
        .as_deref()
        .map(|text| assembly::decode_hex("default_witness_commitment", text))
        .transpose()?;

    let coinbase = assembly::build_coinbase(
        template.height,
        template.coinbasevalue,
        payout_script,
        witness.as_deref(),
        brand,
    );

    let mut txids = Vec::with_capacity(template.transactions.len());
    let mut raw_txs = Vec::with_capacity(template.transactions.len());
    for tx in &template.transactions {
        txids.push(assembly::decode_hash_internal("txid", &tx.txid)?);
        raw_txs.push(assembly::decode_hex("transaction data", &tx.data)?);
    }

    let merkle_root = assembly::merkle_root(assembly::txid(&coinbase), &txids);
    let header_prefix = assembly::serialize_header_prefix(
        template.version,
        &prev_internal,
        &merkle_root,
        template.curtime,
        bits,
        template.height,
    );
    let header_hash = assembly::header_hash(&header_prefix);

    Ok(Job::new(
        id,
        template.height,
        template.version,
        bits,
        template.curtime,
        template.previousblockhash.clone(),
        header_hash,
        pow::seed_hash(template.height),
        network_target,
        header_prefix,
        coinbase,
        raw_txs,
    ))
}
