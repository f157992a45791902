use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

// msg_signature = hex(SHA1(sort([token, timestamp, nonce, echostr]).concat()))

/// Compute the callback signature for the four challenge parameters.
pub fn compute_signature(token: &str, timestamp: &str, nonce: &str, payload: &str) -> String {
    let mut parts = [token, timestamp, nonce, payload];
    // str ordering is byte-wise lexicographic
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Check that `signature` was produced by a holder of `token`.
///
/// Any empty input is rejected without hashing.
pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    payload: &str,
    signature: &str,
) -> bool {
    if signature.is_empty()
        || token.is_empty()
        || timestamp.is_empty()
        || nonce.is_empty()
        || payload.is_empty()
    {
        return false;
    }

    let expected = compute_signature(token, timestamp, nonce, payload);
    expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 1
}
