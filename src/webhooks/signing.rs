//! HMAC-SHA256 signature verification for the source provider's webhook format (spec.md §4.3).
//!
//! Signature header has the form `t=<unix>,v1=<hex>[,v0=<hex>...]`. The MAC is computed over
//! `"<t>.<raw_body>"`, hex-encoded, and compared in constant time. A `v0` scheme or any other
//! unrecognized component is ignored — only `v1` is ever verified.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance window between `t` and the verification moment, in seconds (spec.md §4.3).
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    MalformedHeader,
    MissingV1Scheme,
    Mismatch,
    Stale { timestamp: i64, now: i64, tolerance: i64 },
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::MalformedHeader => write!(f, "malformed signature header"),
            SignatureError::MissingV1Scheme => write!(f, "no v1 signature present"),
            SignatureError::Mismatch => write!(f, "signature does not match computed HMAC"),
            SignatureError::Stale { timestamp, now, tolerance } => {
                write!(f, "timestamp {timestamp} outside tolerance window ({tolerance}s) of now ({now})")
            }
        }
    }
}

impl std::error::Error for SignatureError {}

struct ParsedHeader {
    timestamp: i64,
    v1_signatures: Vec<String>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SignatureError> {
    let mut timestamp = None;
    let mut v1_signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part.split_once('=').ok_or(SignatureError::MalformedHeader)?;
        match key.trim() {
            "t" => {
                timestamp = Some(value.trim().parse::<i64>().map_err(|_| SignatureError::MalformedHeader)?);
            }
            "v1" => v1_signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    Ok(ParsedHeader { timestamp, v1_signatures })
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

/// Compares two strings in time proportional to their length, not to the position of the first
/// mismatch. A length mismatch is itself reported via non-equal bytes rather than an early
/// return, so timing leaks nothing about the true signature's length beyond what the header
/// already reveals.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies `signature_header` against `raw_body` under `secret`, within `tolerance` seconds of
/// `now`. Returns the parsed event timestamp on success.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &str, now: i64, tolerance: i64) -> Result<i64, SignatureError> {
    let parsed = parse_header(signature_header)?;
    if parsed.v1_signatures.is_empty() {
        return Err(SignatureError::MissingV1Scheme);
    }

    if (now - parsed.timestamp).abs() > tolerance {
        return Err(SignatureError::Stale { timestamp: parsed.timestamp, now, tolerance });
    }

    let expected_hex = compute_mac_hex(raw_body, secret, parsed.timestamp);

    let matched = parsed.v1_signatures.iter().any(|candidate| constant_time_eq(candidate.as_bytes(), expected_hex.as_bytes()));

    if matched {
        Ok(parsed.timestamp)
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn compute_mac_hex(raw_body: &[u8], secret: &str, timestamp: i64) -> String {
    let mut signed_content = Vec::with_capacity(raw_body.len() + 32);
    signed_content.extend_from_slice(timestamp.to_string().as_bytes());
    signed_content.push(b'.');
    signed_content.extend_from_slice(raw_body);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(&signed_content);
    to_hex(&mac.finalize().into_bytes())
}

/// Signs a payload in the same `t=...,v1=...` format, for the Live-Stream Client's test fixtures
/// and the managed-endpoint registry's local replay tooling.
pub fn sign(raw_body: &[u8], secret: &str, timestamp: i64) -> String {
    format!("t={timestamp},v1={}", compute_mac_hex(raw_body, secret, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_a_signature_it_just_signed() {
        let body = br#"{"id":"evt_1","type":"customer.created"}"#;
        let header = sign(body, "whsec_test", 1_700_000_000);

        let timestamp = verify(body, &header, "whsec_test", 1_700_000_010, DEFAULT_TOLERANCE_SECONDS).unwrap();
        assert_eq!(timestamp, 1_700_000_000);
    }

    #[test]
    fn verify_rejects_a_tampered_body() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(body, "whsec_test", 1_700_000_000);

        let err = verify(b"{\"id\":\"evt_2\"}", &header, "whsec_test", 1_700_000_010, DEFAULT_TOLERANCE_SECONDS).unwrap_err();
        assert_eq!(err, SignatureError::Mismatch);
    }

    #[test]
    fn verify_rejects_stale_timestamps() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(body, "whsec_test", 1_700_000_000);

        let err = verify(body, &header, "whsec_test", 1_700_000_000 + 301, DEFAULT_TOLERANCE_SECONDS).unwrap_err();
        assert!(matches!(err, SignatureError::Stale { .. }));
    }

    #[test]
    fn verify_rejects_missing_v1_scheme() {
        let body = br#"{"id":"evt_1"}"#;
        let err = verify(body, "t=1700000000,v0=deadbeef", "whsec_test", 1_700_000_000, DEFAULT_TOLERANCE_SECONDS).unwrap_err();
        assert_eq!(err, SignatureError::MissingV1Scheme);
    }

    #[test]
    fn verify_tolerates_an_extra_v0_scheme_alongside_v1() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(body, "whsec_test", 1_700_000_000);
        let header_with_v0 = format!("v0=unused,{header}");

        assert!(verify(body, &header_with_v0, "whsec_test", 1_700_000_000, DEFAULT_TOLERANCE_SECONDS).is_ok());
    }
}
