//! Binary assembly of coinbase transactions, merkle roots, and headers.
//!
//! Everything here is plain byte plumbing in consensus serialization order:
//! little-endian integers, internal (reversed-display) hash order, varint
//! counts. The KawPoW header hash is SHA3-256 over the 80-byte header
//! prefix in which the classic nonce slot carries the block height; the
//! full wire header appends the 64-bit nonce and the mix hash.

use sha2::{Digest as Sha2Digest, Sha256};
use sha3::{Digest as Sha3Digest, Sha3_256};
use thiserror::Error;

/// Assembly failures, all rooted in malformed template fields.
#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("template field {field} is not valid hex: {source}")]
    BadHex {
        field: &'static str,
        source: hex::FromHexError,
    },

    #[error("template field {field} has wrong length {len}, expected {expected}")]
    BadLength {
        field: &'static str,
        len: usize,
        expected: usize,
    },
}

/// Decode a hex field, tagging errors with the field name.
pub fn decode_hex(field: &'static str, text: &str) -> Result<Vec<u8>, AssemblyError> {
    hex::decode(text).map_err(|source| AssemblyError::BadHex { field, source })
}

/// Decode a 32-byte display-order hash into internal (reversed) order.
pub fn decode_hash_internal(field: &'static str, text: &str) -> Result<[u8; 32], AssemblyError> {
    let bytes = decode_hex(field, text)?;
    if bytes.len() != 32 {
        return Err(AssemblyError::BadLength {
            field,
            len: bytes.len(),
            expected: 32,
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out.reverse();
    Ok(out)
}

/// Double SHA-256, the consensus hash for txids, merkle nodes, block hashes.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Append a Bitcoin-style varint count.
pub fn push_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Append a script data push (direct push / PUSHDATA1 / PUSHDATA2).
fn push_script_data(out: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=75 => out.push(data.len() as u8),
        76..=255 => {
            out.push(0x4c);
            out.push(data.len() as u8);
        }
        _ => {
            out.push(0x4d);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
}

/// Append the BIP34 height push: a minimally-encoded script number.
fn push_script_number(out: &mut Vec<u8>, value: u64) {
    if value == 0 {
        out.push(0x00); // OP_0
        return;
    }
    let mut bytes = Vec::with_capacity(5);
    let mut v = value;
    while v > 0 {
        bytes.push((v & 0xff) as u8);
        v >>= 8;
    }
    // Keep the sign bit clear; script numbers are signed.
    if bytes.last().copied().unwrap_or(0) & 0x80 != 0 {
        bytes.push(0x00);
    }
    push_script_data(out, &bytes);
}

/// Placeholder bytes marking where the server's identity sits in the
/// coinbase input. The header hash is fixed per job, so this does not vary
/// per client; extranonce1 partitions the nonce space instead.
const COINBASE_EXTRANONCE_PLACEHOLDER: [u8; 4] = [0u8; 4];

/// Build the serialized coinbase transaction.
///
/// Input script: BIP34 height push, extranonce placeholder, block brand.
/// Outputs: the full reward to `payout_script`, plus the witness
/// commitment when the template carries one.
pub fn build_coinbase(
    height: u64,
    coinbase_value: u64,
    payout_script: &[u8],
    witness_commitment: Option<&[u8]>,
    brand: &[u8],
) -> Vec<u8> {
    let mut script_sig = Vec::with_capacity(16 + brand.len());
    push_script_number(&mut script_sig, height);
    push_script_data(&mut script_sig, &COINBASE_EXTRANONCE_PLACEHOLDER);
    push_script_data(&mut script_sig, brand);

    let mut tx = Vec::with_capacity(128 + script_sig.len() + payout_script.len());

    // version
    tx.extend_from_slice(&2u32.to_le_bytes());

    // one input spending the null outpoint
    push_varint(&mut tx, 1);
    tx.extend_from_slice(&[0u8; 32]);
    tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    push_varint(&mut tx, script_sig.len() as u64);
    tx.extend_from_slice(&script_sig);
    tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());

    // outputs
    let output_count = 1 + witness_commitment.is_some() as u64;
    push_varint(&mut tx, output_count);

    tx.extend_from_slice(&coinbase_value.to_le_bytes());
    push_varint(&mut tx, payout_script.len() as u64);
    tx.extend_from_slice(payout_script);

    if let Some(commitment) = witness_commitment {
        tx.extend_from_slice(&0u64.to_le_bytes());
        push_varint(&mut tx, commitment.len() as u64);
        tx.extend_from_slice(commitment);
    }

    // locktime
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

/// Transaction id in internal order.
pub fn txid(tx_bytes: &[u8]) -> [u8; 32] {
    sha256d(tx_bytes)
}

/// Merkle root over the coinbase txid followed by the template txids,
/// all in internal order. Odd levels duplicate their last node.
pub fn merkle_root(coinbase_txid: [u8; 32], tx_txids: &[[u8; 32]]) -> [u8; 32] {
    let mut level: Vec<[u8; 32]> = Vec::with_capacity(1 + tx_txids.len());
    level.push(coinbase_txid);
    level.extend_from_slice(tx_txids);

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&left);
            combined[32..].copy_from_slice(&right);
            next.push(sha256d(&combined));
        }
        level = next;
    }
    level[0]
}

/// Serialize the 80-byte header prefix hashed for KawPoW.
///
/// Layout: version, previous block hash, merkle root, time, bits, height,
/// all little-endian with hashes in internal order. The height occupies
/// the classic 4-byte nonce slot; the real 64-bit nonce lives outside the
/// prefix.
pub fn serialize_header_prefix(
    version: u32,
    prev_hash_internal: &[u8; 32],
    merkle_root: &[u8; 32],
    time: u32,
    bits: u32,
    height: u64,
) -> [u8; 80] {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(prev_hash_internal);
    header[36..68].copy_from_slice(merkle_root);
    header[68..72].copy_from_slice(&time.to_le_bytes());
    header[72..76].copy_from_slice(&bits.to_le_bytes());
    header[76..80].copy_from_slice(&(height as u32).to_le_bytes());
    header
}

/// KawPoW header hash: SHA3-256 over the 80-byte prefix, big-endian bytes.
pub fn header_hash(prefix: &[u8; 80]) -> [u8; 32] {
    Sha3_256::digest(prefix).into()
}

/// Serialize the full 120-byte wire header: prefix, 64-bit nonce, mix hash
/// in internal order.
pub fn serialize_full_header(prefix: &[u8; 80], nonce: u64, mix_hash_be: &[u8; 32]) -> [u8; 120] {
    let mut header = [0u8; 120];
    header[0..80].copy_from_slice(prefix);
    header[80..88].copy_from_slice(&nonce.to_le_bytes());
    let mut mix = *mix_hash_be;
    mix.reverse();
    header[88..120].copy_from_slice(&mix);
    header
}

/// Display-order hash of a full wire header, for `getblock` confirmation.
pub fn block_hash_hex(full_header: &[u8; 120]) -> String {
    let mut hash = sha256d(full_header);
    hash.reverse();
    hex::encode(hash)
}

/// Assemble the submit-ready block hex: header, tx count, coinbase, then
/// the template transactions verbatim.
pub fn assemble_block_hex(
    full_header: &[u8; 120],
    coinbase: &[u8],
    raw_txs: &[Vec<u8>],
) -> String {
    let mut block =
        Vec::with_capacity(120 + 9 + coinbase.len() + raw_txs.iter().map(Vec::len).sum::<usize>());
    block.extend_from_slice(full_header);
    push_varint(&mut block, 1 + raw_txs.len() as u64);
    block.extend_from_slice(coinbase);
    for tx in raw_txs {
        block.extend_from_slice(tx);
    }
    hex::encode(block)
}
