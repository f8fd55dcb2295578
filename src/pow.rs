//! KawPoW proof-of-work primitive.
//!
//! The hash itself is treated as an opaque engine behind the [`PowVerifier`]
//! trait: callers hand it the job's header hash, the miner's nonce and mix
//! hash, and the block height, and get back the final result hash if the mix
//! checks out. The trait seam lets tests substitute deterministic fakes and
//! keeps the rest of the server independent of the hashing backend.
//!
//! The epoch schedule (seed hash every 7,500 blocks, iterated Keccak-256)
//! is protocol-defined and lives here too, since jobs need the seed hash
//! for `mining.notify` regardless of which engine verifies shares.

use sha3::{Digest, Keccak256};

/// Blocks per KawPoW epoch.
pub const EPOCH_LENGTH: u64 = 7_500;

/// Number of ProgPoW-style mix rounds the engine runs.
const MIX_ROUNDS: usize = 64;

/// Mix lanes (32 lanes of 32 bits).
const MIX_LANES: usize = 32;

/// Epoch index containing `height`.
pub fn epoch(height: u64) -> u64 {
    height / EPOCH_LENGTH
}

/// Seed hash for the epoch containing `height`.
///
/// Epoch 0 is all zeroes; each later epoch applies one more round of
/// Keccak-256 to the previous seed.
pub fn seed_hash(height: u64) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for _ in 0..epoch(height) {
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        seed = hasher.finalize().into();
    }
    seed
}

/// Verifies a miner's proof of work.
///
/// `verify` returns the 32-byte result hash when the submitted mix hash
/// matches the engine's own computation for `(header_hash, nonce, height)`,
/// and `None` when it does not. The result hash is what gets compared
/// against share and network targets.
pub trait PowVerifier: Send + Sync {
    fn verify(
        &self,
        header_hash: &[u8; 32],
        nonce: u64,
        height: u64,
        mix_hash: &[u8; 32],
    ) -> Option<[u8; 32]>;
}

/// The built-in KawPoW engine.
#[derive(Debug, Default)]
pub struct Kawpow;

impl Kawpow {
    pub fn new() -> Self {
        Self
    }

    /// Initial seed: Keccak-256 over header hash and little-endian nonce.
    fn initial_seed(header_hash: &[u8; 32], nonce: u64) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(header_hash);
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().into()
    }

    /// Per-epoch operation schedule for the mix rounds.
    ///
    /// KawPoW re-keys its random math every epoch; the schedule is a keyed
    /// LCG stream so every verifier derives the same sequence.
    fn round_schedule(epoch: u64) -> [u8; 256] {
        let mut state = epoch.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let mut schedule = [0u8; 256];
        for slot in schedule.iter_mut() {
            state = state.wrapping_mul(0x5851_f42d_4c95_7f2d).wrapping_add(1);
            *slot = (state >> 56) as u8;
        }
        schedule
    }

    /// Run the mix rounds and compress down to the 32-byte mix hash.
    pub(crate) fn mix_hash(header_hash: &[u8; 32], nonce: u64, height: u64) -> [u8; 32] {
        let seed = Self::initial_seed(header_hash, nonce);

        let mut mix = [0u32; MIX_LANES];
        for (i, lane) in mix.iter_mut().enumerate() {
            *lane = u32::from_le_bytes([
                seed[i % 32],
                seed[(i + 1) % 32],
                seed[(i + 2) % 32],
                seed[(i + 3) % 32],
            ]);
        }

        let schedule = Self::round_schedule(epoch(height));
        for round in 0..MIX_ROUNDS {
            let op = schedule[round % schedule.len()];
            let src = (round * 3) % MIX_LANES;
            let dst = (round * 5) % MIX_LANES;
            mix[dst] = match op % 8 {
                0 => mix[dst].wrapping_add(mix[src]),
                1 => mix[dst].wrapping_mul(mix[src]),
                2 => mix[dst] ^ mix[src],
                3 => mix[dst].rotate_left(mix[src] % 32),
                4 => mix[dst] & mix[src],
                5 => mix[dst] | mix[src],
                6 => mix[dst].wrapping_sub(mix[src]),
                _ => !mix[dst],
            };
        }

        // Compress 32 lanes down to 8 words
        let mut out = [0u8; 32];
        for i in 0..8 {
            let word = mix[i * 4] ^ mix[i * 4 + 1] ^ mix[i * 4 + 2] ^ mix[i * 4 + 3];
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Final result hash: Keccak-256 over the initial seed and mix hash.
    pub(crate) fn result_hash(header_hash: &[u8; 32], nonce: u64, mix: &[u8; 32]) -> [u8; 32] {
        let seed = Self::initial_seed(header_hash, nonce);
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        hasher.update(mix);
        hasher.finalize().into()
    }
}

impl PowVerifier for Kawpow {
    fn verify(
        &self,
        header_hash: &[u8; 32],
        nonce: u64,
        height: u64,
        mix_hash: &[u8; 32],
    ) -> Option<[u8; 32]> {
        let expected = Self::mix_hash(header_hash, nonce, height);
        if &expected != mix_hash {
            return None;
        }
        Some(Self::result_hash(header_hash, nonce, mix_hash))
    }
}

/// Function-backed verifier for deterministic tests.
///
/// Wraps a closure from `(header_hash, nonce, height, mix_hash)` to the
/// engine's answer, so tests can script exact result hashes (or mix
/// rejections) per submission.
#[cfg(test)]
pub(crate) struct FnVerifier<F>(pub F);

#[cfg(test)]
impl<F> PowVerifier for FnVerifier<F>
where
    F: Fn(&[u8; 32], u64, u64, &[u8; 32]) -> Option<[u8; 32]> + Send + Sync,
{
    fn verify(
        &self,
        header_hash: &[u8; 32],
        nonce: u64,
        height: u64,
        mix_hash: &[u8; 32],
    ) -> Option<[u8; 32]> {
        (self.0)(header_hash, nonce, height, mix_hash)
    }
}
