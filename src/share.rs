//! Share validation.
//!
//! Takes a parsed `mining.submit`, the job it references, and the miner's
//! current difficulty, and produces one of three outcomes: rejected (with
//! the wire error), valid share, or valid share that is also a block. The
//! checks run in a fixed order and short-circuit on the first failure;
//! notably the duplicate check records the submission before the proof is
//! verified, so replays of an invalid share are still duplicates.

use crate::job::{assembly, Job};
use crate::pow::PowVerifier;
use crate::stratum::error::StratumError;
use crate::u256::U256;

/// A syntactically valid submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSubmit {
    pub nonce: u64,
    pub header_hash: [u8; 32],
    pub mix_hash: [u8; 32],
}

/// A share that passed validation.
#[derive(Debug, Clone)]
pub struct ValidShare {
    /// Difficulty the share's hash actually met.
    pub share_diff: f64,

    /// Result hash from the proof-of-work engine, big-endian.
    pub result_hash: [u8; 32],

    /// Present when the hash also meets the network target.
    pub block: Option<FoundBlock>,
}

/// A share good enough to be a block.
#[derive(Debug, Clone)]
pub struct FoundBlock {
    /// Submit-ready serialized block.
    pub block_hex: String,

    /// Display-order block hash, for post-submit confirmation.
    pub block_hash: String,
}

/// Shape-check the hex fields of a submission.
///
/// Nonce is 16 hex chars parsed big-endian; header and mix hashes are 64.
pub fn parse_submit(
    nonce_hex: &str,
    header_hash_hex: &str,
    mix_hash_hex: &str,
) -> Result<ParsedSubmit, StratumError> {
    if nonce_hex.len() != 16 {
        return Err(StratumError::Other("Malformed nonce".into()));
    }
    let nonce = u64::from_str_radix(nonce_hex, 16)
        .map_err(|_| StratumError::Other("Malformed nonce".into()))?;

    Ok(ParsedSubmit {
        nonce,
        header_hash: parse_hash32(header_hash_hex, "header hash")?,
        mix_hash: parse_hash32(mix_hash_hex, "mix hash")?,
    })
}

fn parse_hash32(text: &str, what: &str) -> Result<[u8; 32], StratumError> {
    if text.len() != 64 {
        return Err(StratumError::Other(format!("Malformed {}", what)));
    }
    let bytes =
        hex::decode(text).map_err(|_| StratumError::Other(format!("Malformed {}", what)))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Validate a share against its job.
///
/// Ordered checks: job binding, nonce-prefix binding to the miner,
/// duplicate insertion, proof verification, share difficulty, network
/// target.
pub fn validate(
    job: &Job,
    extranonce1: u32,
    difficulty: f64,
    submit: &ParsedSubmit,
    verifier: &dyn PowVerifier,
) -> Result<ValidShare, StratumError> {
    // The miner must be mining the job it names.
    if submit.header_hash != job.header_hash {
        return Err(StratumError::Other("Header hash mismatch".into()));
    }

    // The nonce's high bytes carry the assigned extranonce1.
    if (submit.nonce >> 32) as u32 != extranonce1 {
        return Err(StratumError::Other("Nonce outside assigned range".into()));
    }

    // Atomic insert; a collision is a duplicate no matter what follows.
    if !job.try_record_submission(submit.nonce, extranonce1) {
        return Err(StratumError::DuplicateShare);
    }

    let result_hash = verifier
        .verify(&job.header_hash, submit.nonce, job.height, &submit.mix_hash)
        .ok_or_else(|| StratumError::Other("Bad proof of work".into()))?;

    let share_diff = U256::difficulty_of_hash(U256::from_be_bytes(result_hash));
    if share_diff < difficulty {
        return Err(StratumError::LowDifficulty);
    }

    let result_value = U256::from_be_bytes(result_hash);
    let block = if result_value <= job.network_target {
        let full_header =
            assembly::serialize_full_header(&job.header_prefix, submit.nonce, &submit.mix_hash);
        Some(FoundBlock {
            block_hex: assembly::assemble_block_hex(&full_header, &job.coinbase, &job.raw_txs),
            block_hash: assembly::block_hash_hex(&full_header),
        })
    } else {
        None
    };

    Ok(ValidShare {
        share_diff,
        result_hash,
        block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::job_with;
    use crate::pow::FnVerifier;

    const EXTRANONCE1: u32 = 0x0000_0001;

    /// Nonce carrying the test extranonce1 prefix.
    fn bound_nonce(low: u32) -> u64 {
        ((EXTRANONCE1 as u64) << 32) | low as u64
    }

    fn submit(nonce: u64, header_hash: [u8; 32]) -> ParsedSubmit {
        ParsedSubmit {
            nonce,
            header_hash,
            mix_hash: [0x33u8; 32],
        }
    }

    /// Verifier answering a fixed result hash.
    fn fixed_result(result: [u8; 32]) -> impl PowVerifier {
        FnVerifier(move |_: &[u8; 32], _, _, _: &[u8; 32]| Some(result))
    }

    /// Result hash meeting difficulty 1 but not the test network target.
    fn share_grade_hash() -> [u8; 32] {
        // diff1 exactly: share_diff == 1.0
        U256::diff1().to_be_bytes()
    }

    #[test]
    fn test_parse_submit_shapes() {
        let good = parse_submit(
            "0000000100000002",
            &"aa".repeat(32),
            &"bb".repeat(32),
        )
        .unwrap();
        assert_eq!(good.nonce, 0x0000_0001_0000_0002);
        assert_eq!(good.header_hash, [0xaa; 32]);
        assert_eq!(good.mix_hash, [0xbb; 32]);

        assert!(parse_submit("0001", &"aa".repeat(32), &"bb".repeat(32)).is_err());
        assert!(parse_submit("000000010000000g", &"aa".repeat(32), &"bb".repeat(32)).is_err());
        assert!(parse_submit("0000000100000002", "aabb", &"bb".repeat(32)).is_err());
        assert!(parse_submit("0000000100000002", &"aa".repeat(32), "bb").is_err());
    }

    #[test]
    fn test_header_hash_binding() {
        let job = job_with(1, 100, [0x11u8; 32]);
        let verifier = fixed_result(share_grade_hash());

        let err = validate(
            &job,
            EXTRANONCE1,
            1.0,
            &submit(bound_nonce(1), [0x99u8; 32]),
            &verifier,
        )
        .unwrap_err();
        assert_eq!(err.code(), 20);
    }

    #[test]
    fn test_nonce_prefix_binding() {
        let job = job_with(1, 100, [0x11u8; 32]);
        let verifier = fixed_result(share_grade_hash());

        // Prefix belongs to someone else.
        let foreign = ((EXTRANONCE1 as u64 + 1) << 32) | 7;
        let err = validate(
            &job,
            EXTRANONCE1,
            1.0,
            &submit(foreign, [0x11u8; 32]),
            &verifier,
        )
        .unwrap_err();
        assert_eq!(err.code(), 20);
    }

    #[test]
    fn test_duplicate_rejected_second_time() {
        let job = job_with(1, 100, [0x11u8; 32]);
        let verifier = fixed_result(share_grade_hash());
        let sub = submit(bound_nonce(7), [0x11u8; 32]);

        assert!(validate(&job, EXTRANONCE1, 1.0, &sub, &verifier).is_ok());
        let err = validate(&job, EXTRANONCE1, 1.0, &sub, &verifier).unwrap_err();
        assert_eq!(err, StratumError::DuplicateShare);
    }

    #[test]
    fn test_invalid_pow_still_occupies_nonce() {
        let job = job_with(1, 100, [0x11u8; 32]);
        let reject_all = FnVerifier(|_: &[u8; 32], _, _, _: &[u8; 32]| None);
        let sub = submit(bound_nonce(7), [0x11u8; 32]);

        let err = validate(&job, EXTRANONCE1, 1.0, &sub, &reject_all).unwrap_err();
        assert_eq!(err.code(), 20);

        // The same nonce replayed is now a duplicate, not another pow error.
        let err = validate(&job, EXTRANONCE1, 1.0, &sub, &reject_all).unwrap_err();
        assert_eq!(err, StratumError::DuplicateShare);
    }

    #[test]
    fn test_same_nonce_two_miners_both_valid() {
        let job = job_with(1, 100, [0x11u8; 32]);
        let verifier = fixed_result(share_grade_hash());

        let first = ParsedSubmit {
            nonce: (1u64 << 32) | 7,
            header_hash: [0x11u8; 32],
            mix_hash: [0x33u8; 32],
        };
        let second = ParsedSubmit {
            nonce: (2u64 << 32) | 7,
            header_hash: [0x11u8; 32],
            mix_hash: [0x33u8; 32],
        };

        assert!(validate(&job, 1, 1.0, &first, &verifier).is_ok());
        assert!(validate(&job, 2, 1.0, &second, &verifier).is_ok());
    }

    #[test]
    fn test_low_difficulty_rejected() {
        let job = job_with(1, 100, [0x11u8; 32]);
        // Hash meeting exactly difficulty 1.
        let verifier = fixed_result(share_grade_hash());

        let err = validate(
            &job,
            EXTRANONCE1,
            4.0,
            &submit(bound_nonce(1), [0x11u8; 32]),
            &verifier,
        )
        .unwrap_err();
        assert_eq!(err, StratumError::LowDifficulty);
    }

    #[test]
    fn test_valid_share_not_block() {
        // Network target below the share hash: share only.
        let mut job = job_with(1, 100, [0x11u8; 32]);
        job.network_target = U256::diff1() / 1000u64;
        let verifier = fixed_result(share_grade_hash());

        let share = validate(
            &job,
            EXTRANONCE1,
            1.0,
            &submit(bound_nonce(1), [0x11u8; 32]),
            &verifier,
        )
        .unwrap();
        assert!((share.share_diff - 1.0).abs() < 1e-9);
        assert!(share.block.is_none());
    }

    #[test]
    fn test_block_when_meeting_network_target() {
        // Job target from job_with is diff1; a diff1 hash is a block.
        let job = job_with(1, 100, [0x11u8; 32]);
        let verifier = fixed_result(share_grade_hash());

        let share = validate(
            &job,
            EXTRANONCE1,
            1.0,
            &submit(bound_nonce(1), [0x11u8; 32]),
            &verifier,
        )
        .unwrap();

        let block = share.block.expect("expected a block");
        assert_eq!(block.block_hash.len(), 64);

        let bytes = hex::decode(&block.block_hex).unwrap();
        // 120-byte header, then tx count (1: coinbase only), then coinbase.
        assert_eq!(bytes[120], 1);
        assert_eq!(&bytes[121..], &job.coinbase[..]);
        // Nonce sits right after the 80-byte prefix.
        assert_eq!(&bytes[80..88], &bound_nonce(1).to_le_bytes());
    }

    #[test]
    fn test_share_diff_reported() {
        let job = job_with(1, 100, [0x11u8; 32]);
        let verifier = fixed_result((U256::diff1() / 32u64).to_be_bytes());

        let share = validate(
            &job,
            EXTRANONCE1,
            4.0,
            &submit(bound_nonce(1), [0x11u8; 32]),
            &verifier,
        )
        .unwrap();
        assert!((share.share_diff - 32.0).abs() < 1e-6);
    }
}
