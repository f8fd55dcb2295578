//! Mining job and the retained-job store.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use crate::u256::U256;

/// Monotonic 32-bit job identifier, rendered as 8 lowercase hex chars.
///
/// Wraps on overflow; resets on process restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u32);

impl JobId {
    /// Parse the 8-hex-char wire form.
    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 8 {
            return None;
        }
        u32::from_str_radix(text, 16).ok().map(Self)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// An immutable snapshot of what to mine, derived from one block template.
///
/// The only mutable piece is the submission set, which records every
/// `(nonce, extranonce1)` pair seen against this job so duplicates are
/// rejected idempotently.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub height: u64,
    pub version: u32,
    pub bits: u32,
    pub ntime: u32,

    /// Display-order hex of the template's previous block hash.
    pub prev_block_hash: String,

    /// KawPoW input hash of the 80-byte header prefix, big-endian.
    pub header_hash: [u8; 32],

    /// Epoch seed hash for the job's height.
    pub seed_hash: [u8; 32],

    /// Full network target expanded from `bits`.
    pub network_target: U256,

    /// Serialized header prefix (everything but nonce and mix hash).
    pub header_prefix: [u8; 80],

    /// Serialized coinbase transaction.
    pub coinbase: Vec<u8>,

    /// Raw template transactions, in template order.
    pub raw_txs: Vec<Vec<u8>>,

    /// Assembly timestamp.
    pub created: Instant,

    submissions: Mutex<HashSet<(u64, u32)>>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        height: u64,
        version: u32,
        bits: u32,
        ntime: u32,
        prev_block_hash: String,
        header_hash: [u8; 32],
        seed_hash: [u8; 32],
        network_target: U256,
        header_prefix: [u8; 80],
        coinbase: Vec<u8>,
        raw_txs: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            height,
            version,
            bits,
            ntime,
            prev_block_hash,
            header_hash,
            seed_hash,
            network_target,
            header_prefix,
            coinbase,
            raw_txs,
            created: Instant::now(),
            submissions: Mutex::new(HashSet::new()),
        }
    }

    /// Record a submission. Returns false when the same `(nonce,
    /// extranonce1)` pair was already seen against this job.
    ///
    /// Insertion is atomic under the job's own lock, so two clients
    /// submitting concurrently cannot both win with the same pair.
    pub fn try_record_submission(&self, nonce: u64, extranonce1: u32) -> bool {
        self.submissions
            .lock()
            .expect("submission set lock poisoned")
            .insert((nonce, extranonce1))
    }

    pub fn header_hash_hex(&self) -> String {
        hex::encode(self.header_hash)
    }

    pub fn seed_hash_hex(&self) -> String {
        hex::encode(self.seed_hash)
    }
}

/// Jobs still accepting submissions.
///
/// Holds every job of the current height; a new-block transition evicts
/// all of them. Lookup misses answer the miner with "job not found".
#[derive(Debug, Default)]
pub struct JobStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<JobId, std::sync::Arc<Job>>,
    current: Option<std::sync::Arc<Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a job. `new_block` evicts everything from the previous
    /// height first.
    pub fn publish(&self, job: std::sync::Arc<Job>, new_block: bool) {
        let mut inner = self.inner.write().expect("job store lock poisoned");
        if new_block {
            inner.jobs.clear();
        }
        inner.jobs.insert(job.id, job.clone());
        inner.current = Some(job);
    }

    /// Look up a retained job by id.
    pub fn get(&self, id: JobId) -> Option<std::sync::Arc<Job>> {
        self.inner
            .read()
            .expect("job store lock poisoned")
            .jobs
            .get(&id)
            .cloned()
    }

    /// The most recently published job.
    pub fn current(&self) -> Option<std::sync::Arc<Job>> {
        self.inner
            .read()
            .expect("job store lock poisoned")
            .current
            .clone()
    }

    /// Number of retained jobs.
    pub fn len(&self) -> usize {
        self.inner.read().expect("job store lock poisoned").jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::testing::job_with;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_job_id_wire_form() {
        assert_eq!(JobId(1).to_string(), "00000001");
        assert_eq!(JobId(0xdead_beef).to_string(), "deadbeef");
        assert_eq!(JobId::parse("deadbeef"), Some(JobId(0xdead_beef)));
        assert_eq!(JobId::parse("deadbee"), None);
        assert_eq!(JobId::parse("deadbeeg"), None);
    }

    #[test]
    fn test_duplicate_submission_rejected() {
        let job = job_with(1, 100, [0u8; 32]);
        assert!(job.try_record_submission(42, 7));
        assert!(!job.try_record_submission(42, 7));
    }

    #[test]
    fn test_same_nonce_different_extranonce_allowed() {
        let job = job_with(1, 100, [0u8; 32]);
        assert!(job.try_record_submission(42, 1));
        assert!(job.try_record_submission(42, 2));
        // Each is idempotent afterwards.
        assert!(!job.try_record_submission(42, 1));
        assert!(!job.try_record_submission(42, 2));
    }

    #[test]
    fn test_store_same_height_retains_previous() {
        let store = JobStore::new();
        let first = Arc::new(job_with(1, 100, [1u8; 32]));
        let second = Arc::new(job_with(2, 100, [2u8; 32]));

        store.publish(first.clone(), true);
        store.publish(second.clone(), false);

        // A refresh keeps the prior job submittable.
        assert!(store.get(JobId(1)).is_some());
        assert!(store.get(JobId(2)).is_some());
        assert_eq!(store.current().unwrap().id, JobId(2));
    }

    #[test]
    fn test_store_new_block_evicts_superseded() {
        let store = JobStore::new();
        store.publish(Arc::new(job_with(1, 100, [1u8; 32])), true);
        store.publish(Arc::new(job_with(2, 100, [2u8; 32])), false);
        store.publish(Arc::new(job_with(3, 101, [3u8; 32])), true);

        assert!(store.get(JobId(1)).is_none());
        assert!(store.get(JobId(2)).is_none());
        assert!(store.get(JobId(3)).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_empty_until_published() {
        let store = JobStore::new();
        assert!(store.current().is_none());
        assert!(store.is_empty());
    }
}
