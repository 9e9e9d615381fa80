//! Peer identity derived from negotiation descriptions.
//!
//! A peer is identified by the ICE username fragment its own description
//! carries, never by anything the remote side asserts about itself.

use sha2::{Digest, Sha256};

const UFRAG_PREFIX: &str = "a=ice-ufrag:";

/// Returns the value of the first `a=ice-ufrag:` line, trimmed, or `""`.
pub fn extract_fragment(description: &str) -> &str {
    description
        .lines()
        .find_map(|line| line.strip_prefix(UFRAG_PREFIX))
        .map(str::trim)
        .unwrap_or("")
}

/// Same as [`extract_fragment`] but `None` instead of an empty fragment.
pub fn fragment_id(description: &str) -> Option<String> {
    let fragment = extract_fragment(description);
    (!fragment.is_empty()).then(|| fragment.to_string())
}

/// Short, order-independent fingerprint of a pair of fragments.
///
/// Both peers compute the same value, so users can compare it out of band.
pub fn session_fingerprint(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let digest = Sha256::digest(format!("{lo}:{hi}").as_bytes());
    let hex = hex::encode_upper(&digest[..8]);
    hex.as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}
