//! Webhook signature contract
//!
//! `X-Streams-Signature: t=<unix_seconds>,v1=<hex_hmac_sha256>` where the MAC
//! input is `"<unix_seconds>.<raw_body>"` keyed by the stream secret.
//! Verification recomputes and compares in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header name carrying the signature
pub const SIGNATURE_HEADER: &str = "X-Streams-Signature";

/// Compute the hex HMAC over `"<timestamp>.<body>"`
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the full header value for a payload
pub fn signature_header(secret: &str, timestamp: i64, body: &str) -> String {
    format!("t={},v1={}", timestamp, sign(secret, timestamp, body))
}

/// Verify a received header against a body and secret. Comparison of the MAC
/// goes through `Mac::verify_slice`, which is constant time.
pub fn verify(secret: &str, header: &str, body: &str) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<Vec<u8>> = None;

    for part in header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signature = hex::decode(value).ok(),
            _ => {}
        }
    }

    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = "s";
        let body = "{\"a\":1}";
        let timestamp = 1_700_000_000;

        let header = signature_header(secret, timestamp, body);
        assert!(header.starts_with("t=1700000000,v1="));
        assert!(verify(secret, &header, body));
    }

    #[test]
    fn tampered_body_fails() {
        let header = signature_header("s", 1_700_000_000, "{\"a\":1}");
        assert!(!verify("s", &header, "{\"a\":2}"));
    }

    #[test]
    fn tampered_timestamp_fails() {
        let signature = sign("s", 1_700_000_000, "{\"a\":1}");
        let forged = format!("t=1700000001,v1={}", signature);
        assert!(!verify("s", &forged, "{\"a\":1}"));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = signature_header("s", 1_700_000_000, "{\"a\":1}");
        assert!(!verify("other", &header, "{\"a\":1}"));
    }

    #[test]
    fn malformed_header_fails() {
        assert!(!verify("s", "", "{}"));
        assert!(!verify("s", "t=abc,v1=zz", "{}"));
        assert!(!verify("s", "v1=00", "{}"));
    }

    #[test]
    fn known_vector() {
        // Same inputs always produce the same MAC; a receiver recomputing
        // from (t, body, secret) must arrive at the identical header.
        let first = sign("s", 1_700_000_000, "{\"a\":1}");
        let second = sign("s", 1_700_000_000, "{\"a\":1}");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
