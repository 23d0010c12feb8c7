use sha2::{Digest, Sha256};

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Fingerprint of a CQ query as it was executed.
///
/// Whitespace runs are collapsed so reformatting a query does not change its fingerprint.
pub fn query_sha256(query: &str) -> String {
    let canonical = query.split_whitespace().collect::<Vec<_>>().join(" ");
    sha256_hex(&canonical)
}
