//! Stratum TCP server: listener, client registry, job fan-out.
//!
//! The server owns the listening socket. Each accepted connection gets a
//! unique extranonce1 from a monotonic counter, a registry slot, and its
//! own session task. Job events from the manager are fanned out by
//! iterating a snapshot of the registry; only authorized clients receive
//! work. Stopping is idempotent: the shutdown token cancels the accept
//! loop and every session, then waits out a bounded grace period before
//! abandoning stragglers.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::client::{ClientSession, SessionContext};
use super::connection::Connection;
use super::error::SessionError;
use crate::job::JobEvent;
use crate::tracing::prelude::*;

/// Grace period for session teardown on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-client job queue depth. A slow client only delays itself.
const CLIENT_JOB_QUEUE: usize = 16;

/// Listener setup failures, each with a distinct operator-facing message.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("bind {0}: address already in use (is another instance running?)")]
    AddrInUse(String),

    #[error("bind {0}: permission denied (privileged port?)")]
    AccessDenied(String),

    #[error("bind {0}: address not available on this host")]
    AddrNotAvailable(String),

    #[error("bind {0}: network unreachable")]
    NetworkUnreachable(String),

    #[error("bind {0}: {1}")]
    Io(String, io::Error),
}

/// Handle the registry keeps per connected client.
struct ClientHandle {
    job_tx: mpsc::Sender<JobEvent>,
    authorized: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Connected-client registry keyed by extranonce1.
///
/// Mutated only from the accept path (insert) and a session's own exit
/// path (remove); broadcast iteration works on a snapshot.
#[derive(Default)]
struct Registry {
    clients: RwLock<HashMap<u32, ClientHandle>>,
}

impl Registry {
    fn insert(&self, extranonce1: u32, handle: ClientHandle) {
        self.clients
            .write()
            .expect("registry lock poisoned")
            .insert(extranonce1, handle);
    }

    fn remove(&self, extranonce1: u32) {
        self.clients
            .write()
            .expect("registry lock poisoned")
            .remove(&extranonce1);
    }

    fn len(&self) -> usize {
        self.clients.read().expect("registry lock poisoned").len()
    }

    /// Snapshot the authorized clients' job queues.
    fn authorized_senders(&self) -> Vec<(u32, mpsc::Sender<JobEvent>)> {
        self.clients
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|(_, handle)| handle.authorized.load(Ordering::Acquire))
            .map(|(&id, handle)| (id, handle.job_tx.clone()))
            .collect()
    }

    fn cancel_all(&self) {
        for handle in self
            .clients
            .read()
            .expect("registry lock poisoned")
            .values()
        {
            handle.cancel.cancel();
        }
    }
}

/// The stratum server.
pub struct StratumServer {
    ctx: Arc<SessionContext>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_extranonce: AtomicU32,
    stopped: AtomicBool,
}

impl StratumServer {
    pub fn new(ctx: Arc<SessionContext>, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            registry: Arc::new(Registry::default()),
            shutdown,
            tracker: TaskTracker::new(),
            next_extranonce: AtomicU32::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    /// Bind the listener, mapping setup errors to operator-facing variants.
    pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => ServerError::AddrInUse(addr.to_string()),
            io::ErrorKind::PermissionDenied => ServerError::AccessDenied(addr.to_string()),
            io::ErrorKind::AddrNotAvailable => ServerError::AddrNotAvailable(addr.to_string()),
            io::ErrorKind::NetworkUnreachable => ServerError::NetworkUnreachable(addr.to_string()),
            _ => ServerError::Io(addr.to_string(), e),
        })
    }

    /// Connected client count.
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Request shutdown. Idempotent; `run` performs the actual teardown.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("Stratum server stopping");
        }
        self.shutdown.cancel();
    }

    /// Accept connections and fan out jobs until shutdown.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut job_rx: mpsc::Receiver<JobEvent>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "Stratum server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => self.accept_client(stream, remote),
                        Err(e) => {
                            // Transient resource exhaustion; keep serving.
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }

                Some(event) = job_rx.recv() => {
                    self.broadcast(event);
                }

                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }

        drop(listener);
        self.finish().await;
        Ok(())
    }

    fn accept_client(&self, stream: tokio::net::TcpStream, remote: std::net::SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "set_nodelay failed");
        }

        let extranonce1 = self.next_extranonce.fetch_add(1, Ordering::Relaxed);
        let (job_tx, job_rx) = mpsc::channel(CLIENT_JOB_QUEUE);
        let authorized = Arc::new(AtomicBool::new(false));
        let cancel = self.shutdown.child_token();

        self.registry.insert(
            extranonce1,
            ClientHandle {
                job_tx,
                authorized: authorized.clone(),
                cancel: cancel.clone(),
            },
        );

        info!(
            remote = %remote,
            extranonce1 = %format_args!("{:08x}", extranonce1),
            clients = self.registry.len(),
            "Client connected"
        );

        let session = ClientSession::new(
            self.ctx.clone(),
            extranonce1,
            remote,
            job_rx,
            authorized,
            cancel,
        );
        let registry = self.registry.clone();
        self.tracker.spawn(async move {
            let result = session.run(Connection::new(stream)).await;
            registry.remove(extranonce1);
            match result {
                Ok(()) => {
                    info!(remote = %remote, clients = registry.len(), "Client disconnected");
                }
                Err(SessionError::IdleTimeout) => {
                    info!(remote = %remote, "Client timed out");
                }
                Err(SessionError::TooManyViolations) => {
                    warn!(remote = %remote, "Client dropped after repeated protocol violations");
                }
                Err(e) => {
                    debug!(remote = %remote, error = %e, "Client connection error");
                }
            }
        });
    }

    /// Fan a job event out to every authorized client.
    fn broadcast(&self, event: JobEvent) {
        let targets = self.registry.authorized_senders();
        debug!(
            job_id = %event.job.id,
            clean_jobs = event.clean_jobs,
            clients = targets.len(),
            "Broadcasting job"
        );
        for (extranonce1, sender) in targets {
            if sender.try_send(event.clone()).is_err() {
                warn!(
                    extranonce1 = %format_args!("{:08x}", extranonce1),
                    "Client job queue full, dropping notification"
                );
            }
        }
    }

    /// Cancel every session and wait out the grace period.
    async fn finish(&self) {
        self.registry.cancel_all();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Session teardown exceeded grace period, abandoning stragglers");
        }
        info!(clients = self.registry.len(), "Stratum server stopped");
    }
}
