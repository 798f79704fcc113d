//! Payments processor webhook verification (`t=<unix>,v1=<hex>` scheme).

use chrono::{DateTime, Utc};
use fieldsync_core::billing::PaymentEvent;
use fieldsync_core::{Error, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Maximum age of a signed delivery.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<RawEventData>,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: RawObject,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    last_payment_error: Option<RawPaymentError>,
    #[serde(default)]
    cancellation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentError {
    #[serde(default)]
    message: Option<String>,
}

/// Verifies `header` against `body`.
///
/// Any of several `v1` entries may match (the processor sends one per active
/// secret during rotation).
#[tracing::instrument(level = "debug", skip_all)]
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<()> {
    let invalid = |why: &str| Error::Unauthorized(format!("invalid payments signature: {why}"));

    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => {
                if let Ok(sig) = hex::decode(v) {
                    candidates.push(sig);
                }
            }
            _ => {}
        }
    }
    let Some(t) = timestamp else {
        return Err(invalid("missing timestamp"));
    };
    if candidates.is_empty() {
        return Err(invalid("missing v1 signature"));
    }
    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    let skew = now.timestamp().checked_sub(t).map(i64::unsigned_abs);
    if !skew.is_some_and(|s| s <= tolerance) {
        return Err(invalid("timestamp outside tolerance"));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| invalid("bad secret"))?;
    mac.update(t.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    if candidates
        .iter()
        .any(|sig| mac.clone().verify_slice(sig).is_ok())
    {
        Ok(())
    } else {
        Err(invalid("no matching signature"))
    }
}

/// Header value for `body` signed at `t`.
pub fn sign_payload(secret: &str, t: i64, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::backend("init payments hmac", e))?;
    mac.update(t.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("t={t},v1={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn parse_event(body: &[u8]) -> Result<PaymentEvent> {
    let raw: RawEvent = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidInput(format!("malformed payments event: {e}")))?;
    let object = raw.data.map(|d| d.object);
    let is_intent = raw.event_type.starts_with("payment_intent.");
    let (processor_payment_id, failure_message) = match object {
        Some(o) if is_intent => (
            o.id,
            o.last_payment_error
                .and_then(|e| e.message)
                .or(o.cancellation_reason),
        ),
        _ => (None, None),
    };
    Ok(PaymentEvent {
        event_id: raw.id,
        event_type: raw.event_type,
        processor_payment_id,
        failure_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_714_560_000, 0).unwrap()
    }

    #[test]
    fn accepts_fresh_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign_payload("whsec", now().timestamp() - 10, body).unwrap();
        verify_signature("whsec", &header, body, now(), DEFAULT_TOLERANCE_SECS).unwrap();
    }

    #[test]
    fn rejects_stale_or_forged_signatures() {
        let body = br#"{"id":"evt_1"}"#;
        let stale = sign_payload("whsec", now().timestamp() - 301, body).unwrap();
        assert!(verify_signature("whsec", &stale, body, now(), DEFAULT_TOLERANCE_SECS).is_err());

        let forged = sign_payload("other", now().timestamp(), body).unwrap();
        assert!(verify_signature("whsec", &forged, body, now(), DEFAULT_TOLERANCE_SECS).is_err());

        assert!(verify_signature("whsec", "v1=abcd", body, now(), DEFAULT_TOLERANCE_SECS).is_err());

        for extreme in [i64::MIN, i64::MAX] {
            let header = format!("t={extreme},v1=00");
            assert!(verify_signature("whsec", &header, body, now(), DEFAULT_TOLERANCE_SECS).is_err());
        }
    }

    #[test]
    fn any_listed_v1_may_match() {
        let body = b"{}";
        let t = now().timestamp();
        let good = sign_payload("whsec", t, body).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={t},v1={},v1={good_sig}", "00".repeat(32));
        verify_signature("whsec", &header, body, now(), DEFAULT_TOLERANCE_SECS).unwrap();
    }

    #[test]
    fn parses_failed_intent_event() {
        let body = br#"{
            "id": "evt_9",
            "type": "payment_intent.payment_failed",
            "data": {"object": {"id": "pi_9", "last_payment_error": {"message": "card declined"}}}
        }"#;
        let e = parse_event(body).unwrap();
        assert_eq!(e.event_id, "evt_9");
        assert_eq!(e.processor_payment_id.as_deref(), Some("pi_9"));
        assert_eq!(e.failure_message.as_deref(), Some("card declined"));
        assert_eq!(e.status(), Some(fieldsync_core::billing::PaymentStatus::Failed));
    }

    #[test]
    fn non_intent_events_carry_no_payment_id() {
        let body = br#"{"id":"evt_2","type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;
        let e = parse_event(body).unwrap();
        assert!(e.processor_payment_id.is_none());
        assert!(e.status().is_none());
    }
}
