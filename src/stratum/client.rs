//! Per-connection client session.
//!
//! Each accepted socket runs one session task owning the connection's
//! protocol state: the subscribe/authorize handshake, share submission,
//! difficulty retargeting, and the idle timeout. Handling is strictly
//! sequential per connection; job broadcasts arrive on a channel and are
//! interleaved between requests, never inside one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::connection::Transport;
use super::error::{SessionError, SessionResult, StratumError};
use super::messages::{self, ClientRequest, JsonRpcMessage, SubmitParams};
use crate::job::{Job, JobEvent, JobId, JobStore, ManagerCommand};
use crate::pow::PowVerifier;
use crate::share;
use crate::tracing::prelude::*;
use crate::u256::U256;
use crate::vardiff::{self, ShareWindow, VardiffConfig};

/// Consecutive malformed lines tolerated before the connection closes.
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 3;

/// Server-wide dependencies shared by every session.
pub struct SessionContext {
    pub store: Arc<JobStore>,
    pub verifier: Arc<dyn PowVerifier>,
    pub vardiff: VardiffConfig,
    /// Difficulty assigned to fresh clients.
    pub initial_diff: f64,
    pub idle_timeout: Duration,
    pub manager_tx: mpsc::Sender<ManagerCommand>,
    pub share_tx: mpsc::Sender<ShareEvent>,
}

/// Emitted for every accepted share.
#[derive(Debug, Clone)]
pub struct ShareEvent {
    pub worker: String,
    pub remote: SocketAddr,
    pub job_id: JobId,
    pub height: u64,
    pub share_diff: f64,
    pub is_valid_block: bool,
    /// Display-order block hash, set when the block was accepted upstream.
    pub block_hash: Option<String>,
}

/// One miner connection's state machine.
pub struct ClientSession {
    ctx: Arc<SessionContext>,
    extranonce1: u32,
    remote: SocketAddr,
    job_rx: mpsc::Receiver<JobEvent>,
    /// Shared with the server registry so broadcasts can skip
    /// not-yet-authorized connections without locking session state.
    authorized: Arc<AtomicBool>,
    cancel: CancellationToken,

    subscribed: bool,
    worker: Option<String>,
    difficulty: f64,
    window: ShareWindow,
    last_retarget_ms: u64,
    violations: u32,
}

impl ClientSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        extranonce1: u32,
        remote: SocketAddr,
        job_rx: mpsc::Receiver<JobEvent>,
        authorized: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        let difficulty = ctx.initial_diff;
        Self {
            ctx,
            extranonce1,
            remote,
            job_rx,
            authorized,
            cancel,
            subscribed: false,
            worker: None,
            difficulty,
            window: ShareWindow::new(),
            // Gate the first retarget against connection time.
            last_retarget_ms: wall_clock_ms(),
            violations: 0,
        }
    }

    /// The 8-hex-char extranonce1, doubling as the subscription id.
    pub fn extranonce1_hex(&self) -> String {
        format!("{:08x}", self.extranonce1)
    }

    fn ready(&self) -> bool {
        self.subscribed && self.authorized.load(Ordering::Acquire)
    }

    /// Drive the session until close, timeout, violation, or shutdown.
    pub async fn run(mut self, mut conn: impl Transport) -> SessionResult<()> {
        let idle = self.ctx.idle_timeout;
        let mut deadline = tokio::time::Instant::now() + idle;

        loop {
            tokio::select! {
                result = conn.read_message() => {
                    deadline = tokio::time::Instant::now() + idle;
                    match result {
                        Ok(Some(msg)) => {
                            self.violations = 0;
                            self.handle_message(&mut conn, msg).await?;
                        }
                        Ok(None) => {
                            debug!(remote = %self.remote, "Connection closed by miner");
                            return Ok(());
                        }
                        Err(SessionError::InvalidMessage(detail)) => {
                            self.violations += 1;
                            warn!(
                                remote = %self.remote,
                                violations = self.violations,
                                detail = %detail,
                                "Malformed message"
                            );
                            if self.violations >= MAX_PROTOCOL_VIOLATIONS {
                                return Err(SessionError::TooManyViolations);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }

                Some(event) = self.job_rx.recv() => {
                    if self.ready() {
                        self.send_job(&mut conn, &event.job, event.clean_jobs).await?;
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SessionError::IdleTimeout);
                }

                _ = self.cancel.cancelled() => {
                    debug!(remote = %self.remote, "Session cancelled by server shutdown");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        conn: &mut impl Transport,
        msg: JsonRpcMessage,
    ) -> SessionResult<()> {
        let (id, method, params) = match msg {
            JsonRpcMessage::Request { id, method, params } => (id, method, params),
            JsonRpcMessage::Response { .. } => {
                debug!(remote = %self.remote, "Ignoring stray response from miner");
                return Ok(());
            }
        };

        let request = match ClientRequest::parse(&method, &params) {
            Ok(request) => request,
            Err(err) => {
                if let StratumError::MethodNotFound(ref name) = err {
                    warn!(remote = %self.remote, method = %name, "Unknown stratum method");
                }
                return conn.write_message(&JsonRpcMessage::err(id, &err)).await;
            }
        };

        match request {
            ClientRequest::Subscribe { user_agent } => {
                self.handle_subscribe(conn, id, user_agent).await
            }
            ClientRequest::Authorize { worker, password } => {
                self.handle_authorize(conn, id, worker, password).await
            }
            ClientRequest::Submit(params) => self.handle_submit(conn, id, params).await,
            ClientRequest::ExtranonceSubscribe => {
                conn.write_message(&JsonRpcMessage::ok(id, Value::Bool(true)))
                    .await
            }
        }
    }

    async fn handle_subscribe(
        &mut self,
        conn: &mut impl Transport,
        id: Value,
        user_agent: Option<String>,
    ) -> SessionResult<()> {
        let extranonce1 = self.extranonce1_hex();
        debug!(
            remote = %self.remote,
            extranonce1 = %extranonce1,
            user_agent = user_agent.as_deref().unwrap_or(""),
            "Subscribed"
        );

        self.subscribed = true;
        let result = messages::subscribe_result(&extranonce1, &extranonce1, 0);
        conn.write_message(&JsonRpcMessage::ok(id, result)).await?;
        conn.write_message(&messages::set_extranonce(&extranonce1, 0))
            .await
    }

    async fn handle_authorize(
        &mut self,
        conn: &mut impl Transport,
        id: Value,
        worker: String,
        _password: String,
    ) -> SessionResult<()> {
        if !self.subscribed {
            let err = StratumError::Other("Not subscribed".into());
            return conn.write_message(&JsonRpcMessage::err(id, &err)).await;
        }

        info!(remote = %self.remote, worker = %worker, "Worker authorized");
        self.worker = Some(worker);
        self.authorized.store(true, Ordering::Release);

        conn.write_message(&JsonRpcMessage::ok(id, Value::Bool(true)))
            .await?;

        // Difficulty first, then the current job with clean_jobs set.
        conn.write_message(&messages::set_difficulty(self.difficulty))
            .await?;
        if let Some(job) = self.ctx.store.current() {
            self.send_job(conn, &job, true).await?;
        }
        Ok(())
    }

    async fn handle_submit(
        &mut self,
        conn: &mut impl Transport,
        id: Value,
        params: SubmitParams,
    ) -> SessionResult<()> {
        if !self.ready() {
            let err = StratumError::Unauthorized;
            return conn.write_message(&JsonRpcMessage::err(id, &err)).await;
        }

        let job = match JobId::parse(&params.job_id).and_then(|jid| self.ctx.store.get(jid)) {
            Some(job) => job,
            None => {
                debug!(remote = %self.remote, job_id = %params.job_id, "Stale submission");
                return conn
                    .write_message(&JsonRpcMessage::err(id, &StratumError::JobNotFound))
                    .await;
            }
        };

        // The authorized identity wins; a mismatched prefix is only noted.
        if let Some(worker) = &self.worker {
            if &params.worker != worker {
                debug!(
                    remote = %self.remote,
                    submitted = %params.worker,
                    authorized = %worker,
                    "Submit worker differs from authorized worker"
                );
            }
        }

        let parsed = match share::parse_submit(
            &params.nonce_hex,
            &params.header_hash_hex,
            &params.mix_hash_hex,
        ) {
            Ok(parsed) => parsed,
            Err(err) => {
                return conn.write_message(&JsonRpcMessage::err(id, &err)).await;
            }
        };

        let valid = match share::validate(
            &job,
            self.extranonce1,
            self.difficulty,
            &parsed,
            self.ctx.verifier.as_ref(),
        ) {
            Ok(valid) => valid,
            Err(err) => {
                debug!(remote = %self.remote, job_id = %job.id, error = %err, "Share rejected");
                return conn.write_message(&JsonRpcMessage::err(id, &err)).await;
            }
        };

        conn.write_message(&JsonRpcMessage::ok(id, Value::Bool(true)))
            .await?;

        self.record_share_and_retarget(conn).await?;

        // A block goes upstream; the share event fires either way, with the
        // block downgraded to a plain share if the node rejected it.
        let mut accepted_hash = None;
        if let Some(found) = &valid.block {
            info!(
                remote = %self.remote,
                job_id = %job.id,
                height = job.height,
                hash = %found.block_hash,
                "Block candidate found"
            );
            if self.submit_block_upstream(found.block_hex.clone(), found.block_hash.clone()).await {
                accepted_hash = Some(found.block_hash.clone());
            }
        }

        let event = ShareEvent {
            worker: self.worker.clone().unwrap_or_default(),
            remote: self.remote,
            job_id: job.id,
            height: job.height,
            share_diff: valid.share_diff,
            is_valid_block: accepted_hash.is_some(),
            block_hash: accepted_hash,
        };
        if self.ctx.share_tx.send(event).await.is_err() {
            debug!("Share event channel closed");
        }
        Ok(())
    }

    /// Record the accepted share's timestamp and run the retarget check.
    async fn record_share_and_retarget(&mut self, conn: &mut impl Transport) -> SessionResult<()> {
        let now_ms = wall_clock_ms();

        if !self.window.record(now_ms, Instant::now()) {
            debug!(remote = %self.remote, "Share timestamp dropped by clock guard");
            return Ok(());
        }

        let retarget =
            self.ctx
                .vardiff
                .check_adjustment(&self.window, self.difficulty, now_ms, self.last_retarget_ms);
        if let Some(retarget) = retarget {
            info!(
                remote = %self.remote,
                worker = self.worker.as_deref().unwrap_or(""),
                old_diff = self.difficulty,
                new_diff = retarget.new_diff,
                avg_interval = retarget.avg_interval,
                reason = retarget.reason.as_str(),
                hashrate = vardiff::hashrate_estimate(self.difficulty, &self.window),
                "Retargeting difficulty"
            );
            self.difficulty = retarget.new_diff;
            self.last_retarget_ms = now_ms;
            conn.write_message(&messages::set_difficulty(self.difficulty))
                .await?;
        }
        Ok(())
    }

    /// Hand a found block to the job manager; true when the node took it.
    async fn submit_block_upstream(&self, block_hex: String, block_hash: String) -> bool {
        let (tx, rx) = oneshot::channel();
        let command = ManagerCommand::SubmitBlock {
            block_hex,
            block_hash,
            accepted: tx,
        };
        if self.ctx.manager_tx.send(command).await.is_err() {
            warn!("Job manager unavailable for block submission");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn send_job(
        &self,
        conn: &mut impl Transport,
        job: &Job,
        clean_jobs: bool,
    ) -> SessionResult<()> {
        let target = U256::target_for_difficulty(self.difficulty);
        conn.write_message(&messages::notify(job, target, clean_jobs))
            .await
    }
}

/// Milliseconds since the Unix epoch.
fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
