/// Hashing utilities for phishblock-anchor.
///
/// Two digests are in play:
/// - SHA-256 for evidence integrity (snapshot body hash, record content hash)
/// - Keccak-256 for the on-chain reference of a report id
use sha2::{Digest, Sha256};

/// Hash arbitrary data with SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 rendered as `0x`-prefixed lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    to_prefixed_hex(&sha256(data))
}

/// Deterministic ledger reference for a report id: keccak256 of its UTF-8 bytes.
///
/// The same id always anchors to the same on-chain value, so an explorer can
/// recompute it from the auxiliary id carried in the transaction.
pub fn report_reference(report_id: &str) -> [u8; 32] {
    alloy::primitives::keccak256(report_id.as_bytes()).0
}

pub fn to_prefixed_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Compare two secrets in time independent of where they differ.
///
/// Both sides are reduced to SHA-256 digests first, so unequal lengths take
/// the same path as unequal contents.
pub fn secrets_match(a: &[u8], b: &[u8]) -> bool {
    let (a, b) = (sha256(a), sha256(b));
    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}
