//! HMAC-SHA256 verification of inbound processor webhooks.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("signature mismatch")]
    Mismatch,
    #[error("webhook secret is not configured")]
    SecretNotConfigured,
}

fn signed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac)
}

/// Hex encoded HMAC of `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    signed_mac(secret, timestamp, payload)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Builds a `Stripe-Signature` style header value for `payload`.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, payload))
}

fn verify_hex(secret: &str, timestamp: i64, payload: &[u8], candidate: &str) -> bool {
    let Ok(expected) = hex::decode(candidate) else {
        return false;
    };
    // verify_slice compares in constant time
    signed_mac(secret, timestamp, payload)
        .map(|mac| mac.verify_slice(&expected).is_ok())
        .unwrap_or(false)
}

fn parse_stripe_header(value: &str) -> Result<(i64, Vec<&str>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", ts)) => {
                timestamp = Some(ts.parse::<i64>().map_err(|_| SignatureError::MalformedHeader)?)
            }
            Some(("v1", sig)) => signatures.push(sig),
            _ => {}
        }
    }
    match timestamp {
        Some(ts) if !signatures.is_empty() => Ok((ts, signatures)),
        _ => Err(SignatureError::MalformedHeader),
    }
}

/// Verifies a webhook against the shared secret.
///
/// Accepts either a `Stripe-Signature: t=..,v1=..` header or the
/// `x-timestamp` / `x-signature` pair. `now` is unix seconds.
pub fn verify_webhook_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: Option<&str>,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), SignatureError> {
    let secret = secret
        .filter(|s| !s.trim().is_empty())
        .ok_or(SignatureError::SecretNotConfigured)?;

    let (timestamp, signatures) =
        if let Some(raw) = headers.get(STRIPE_SIGNATURE_HEADER) {
            let raw = raw.to_str().map_err(|_| SignatureError::MalformedHeader)?;
            parse_stripe_header(raw)?
        } else {
            let ts = headers
                .get(TIMESTAMP_HEADER)
                .ok_or(SignatureError::MissingHeader)?
                .to_str()
                .map_err(|_| SignatureError::MalformedHeader)?
                .parse::<i64>()
                .map_err(|_| SignatureError::MalformedHeader)?;
            let sig = headers
                .get(SIGNATURE_HEADER)
                .ok_or(SignatureError::MissingHeader)?
                .to_str()
                .map_err(|_| SignatureError::MalformedHeader)?;
            (ts, vec![sig])
        };

    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(SignatureError::TimestampOutOfTolerance);
    }

    if signatures
        .iter()
        .any(|candidate| verify_hex(secret, timestamp, payload, candidate))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn stripe_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(STRIPE_SIGNATURE_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_valid_stripe_signature() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let headers = stripe_headers(&signature_header(SECRET, NOW, payload));
        assert_eq!(
            verify_webhook_signature(&headers, payload, Some(SECRET), 300, NOW + 10),
            Ok(())
        );
    }

    #[test]
    fn accepts_any_of_multiple_v1_signatures() {
        let payload = b"{}";
        let good = compute_signature(SECRET, NOW, payload);
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), good);
        assert!(verify_webhook_signature(&stripe_headers(&header), payload, Some(SECRET), 300, NOW).is_ok());
    }

    #[test]
    fn accepts_generic_timestamp_signature_pair() {
        let payload = b"{\"id\":\"evt_1\"}";
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&NOW.to_string()).unwrap());
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&compute_signature(SECRET, NOW, payload)).unwrap(),
        );
        assert!(verify_webhook_signature(&headers, payload, Some(SECRET), 300, NOW).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let headers = stripe_headers(&signature_header(SECRET, NOW, b"{\"amount\":100}"));
        assert_eq!(
            verify_webhook_signature(&headers, b"{\"amount\":1}", Some(SECRET), 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = b"{}";
        let headers = stripe_headers(&signature_header("whsec_other", NOW, payload));
        assert_eq!(
            verify_webhook_signature(&headers, payload, Some(SECRET), 300, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = b"{}";
        let headers = stripe_headers(&signature_header(SECRET, NOW - 301, payload));
        assert_eq!(
            verify_webhook_signature(&headers, payload, Some(SECRET), 300, NOW),
            Err(SignatureError::TimestampOutOfTolerance)
        );
    }

    #[test]
    fn rejects_extreme_timestamps() {
        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1={}", timestamp, "00".repeat(32));
            assert_eq!(
                verify_webhook_signature(&stripe_headers(&header), b"{}", Some(SECRET), 300, NOW),
                Err(SignatureError::TimestampOutOfTolerance)
            );
        }
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        assert_eq!(
            verify_webhook_signature(&HeaderMap::new(), b"{}", Some(SECRET), 300, NOW),
            Err(SignatureError::MissingHeader)
        );
        assert_eq!(
            verify_webhook_signature(&stripe_headers("v1=abc"), b"{}", Some(SECRET), 300, NOW),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn unconfigured_secret_rejects_everything() {
        let payload = b"{}";
        let headers = stripe_headers(&signature_header(SECRET, NOW, payload));
        assert_eq!(
            verify_webhook_signature(&headers, payload, None, 300, NOW),
            Err(SignatureError::SecretNotConfigured)
        );
    }
}
