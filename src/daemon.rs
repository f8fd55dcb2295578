//! Daemon lifecycle management.
//!
//! Handles startup (upstream probe, address validation, first job), task
//! management, signal handling, and graceful shutdown. SIGUSR1 acts as the
//! block-notify hook: point the coin daemon's `-blocknotify` at
//! `pkill -USR1 stratumd` for sub-poll-interval block detection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::job::{JobManager, JobStore, ManagerCommand, UpstreamEvent};
use crate::node::NodeClient;
use crate::pow::Kawpow;
use crate::stratum::{SessionContext, ShareEvent, StratumServer};
use crate::tracing::prelude::*;

/// The main daemon.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    ///
    /// Any error out of the startup sequence is fatal; the process exits
    /// nonzero without ever accepting a miner connection.
    pub async fn run(self) -> anyhow::Result<()> {
        let node = Arc::new(NodeClient::new(&self.config.rpc)?);
        self.wait_for_upstream(&node).await?;
        let payout_script = self.resolve_payout_script(&node).await?;

        let store = Arc::new(JobStore::new());
        let (job_tx, job_rx) = mpsc::channel(64);
        let (upstream_tx, upstream_rx) = mpsc::channel::<UpstreamEvent>(8);
        let (manager_tx, manager_rx) = mpsc::channel::<ManagerCommand>(32);
        let (share_tx, share_rx) = mpsc::channel::<ShareEvent>(256);

        let mut manager = JobManager::new(
            node,
            store.clone(),
            job_tx,
            upstream_tx,
            manager_rx,
            self.shutdown.clone(),
            payout_script,
            self.config.block_brand.clone().into_bytes(),
            Duration::from_millis(self.config.block_poll_interval_ms),
            Duration::from_secs(self.config.job_update_interval),
        );
        manager
            .init()
            .await
            .context("failed to acquire the initial block template")?;

        let listener = StratumServer::bind(&self.config.bind_addr()).await?;

        let ctx = Arc::new(SessionContext {
            store,
            verifier: Arc::new(Kawpow::new()),
            vardiff: self.config.vardiff.clone(),
            initial_diff: self
                .config
                .vardiff
                .initial_difficulty(self.config.server.port.diff),
            idle_timeout: Duration::from_secs(self.config.server.idle_timeout),
            manager_tx: manager_tx.clone(),
            share_tx,
        });
        let server = Arc::new(StratumServer::new(ctx, self.shutdown.child_token()));

        self.tracker.spawn(async move {
            if let Err(e) = manager.run().await {
                error!(error = %e, "Job manager error");
            }
        });
        self.tracker.spawn({
            let server = server.clone();
            async move {
                if let Err(e) = server.run(listener, job_rx).await {
                    error!(error = %e, "Stratum server error");
                }
            }
        });
        self.tracker
            .spawn(consume_share_events(share_rx, self.shutdown.clone()));
        self.tracker
            .spawn(consume_upstream_events(upstream_rx, self.shutdown.clone()));
        self.tracker.close();

        info!("Started.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigusr1 = unix::signal(SignalKind::user_defined1())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigusr1.recv() => {
                    debug!("Received SIGUSR1 (block notify)");
                    let _ = manager_tx.send(ManagerCommand::BlockNotify).await;
                }
            }
        }

        // Initiate shutdown
        self.shutdown.cancel();
        server.stop();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }

    /// Probe the upstream node until it answers or retries run out.
    async fn wait_for_upstream(&self, node: &NodeClient) -> anyhow::Result<()> {
        let attempts = self.config.startup_retry_attempts.max(1);
        let delay = Duration::from_secs(self.config.startup_retry_delay);

        for attempt in 1..=attempts {
            match node.get_blockchain_info().await {
                Ok(info) => {
                    info!(
                        chain = %info.chain,
                        blocks = info.blocks,
                        best = %info.bestblockhash,
                        "Upstream node reachable"
                    );
                    if info.initialblockdownload {
                        warn!("Upstream node is still in initial block download");
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    // Auth and logical failures will not fix themselves.
                    return Err(e).context("upstream node rejected the probe");
                }
                Err(e) => {
                    warn!(attempt, of = attempts, error = %e, "Upstream probe failed");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        anyhow::bail!(
            "upstream node unreachable after {} attempts",
            attempts
        );
    }

    /// Validate the coinbase address and obtain its payment script.
    async fn resolve_payout_script(&self, node: &NodeClient) -> anyhow::Result<Vec<u8>> {
        let address = &self.config.coinbase_address;
        let validated = node
            .validate_address(address)
            .await
            .context("validateaddress call failed")?;
        if !validated.isvalid {
            anyhow::bail!("coinbase address {} rejected by the node", address);
        }
        let script_hex = validated
            .script_pub_key
            .context("node returned no payment script for the coinbase address")?;
        let script = hex::decode(&script_hex).context("payment script is not valid hex")?;
        info!(address = %address, "Coinbase address validated");
        Ok(script)
    }
}

/// Log accepted shares.
async fn consume_share_events(
    mut share_rx: mpsc::Receiver<ShareEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = share_rx.recv() => {
                let Some(event) = event else { return };
                if event.is_valid_block {
                    info!(
                        worker = %event.worker,
                        height = event.height,
                        share_diff = event.share_diff,
                        block = event.block_hash.as_deref().unwrap_or(""),
                        "Share accepted: BLOCK FOUND"
                    );
                } else {
                    debug!(
                        worker = %event.worker,
                        job_id = %event.job_id,
                        share_diff = event.share_diff,
                        "Share accepted"
                    );
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Reflect upstream availability transitions.
async fn consume_upstream_events(
    mut upstream_rx: mpsc::Receiver<UpstreamEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = upstream_rx.recv() => {
                match event {
                    Some(UpstreamEvent::Disconnected) => {
                        error!("Upstream RPC considered down; jobs are stale until it recovers");
                    }
                    Some(UpstreamEvent::Connected) => {
                        info!("Upstream RPC restored");
                    }
                    None => return,
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
