//! Inbound CRM webhook verification and parsing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use fieldsync_core::sync::WebhookEvent;
use fieldsync_core::{AccountId, Error, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `base64(hmac_sha256(client_secret, body))`.
pub const SIGNATURE_HEADER: &str = "x-crm-hmac-sha256";

#[derive(Debug, Deserialize)]
struct Envelope {
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeData {
    web_hook_event: RawEvent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    topic: String,
    account_id: String,
    item_id: String,
    occurred_at: DateTime<Utc>,
}

/// Checks the body signature in constant time.
#[tracing::instrument(level = "debug", skip_all)]
pub fn verify_signature(secret: &str, signature_header: &str, body: &[u8]) -> Result<()> {
    let invalid = || Error::Unauthorized("invalid webhook signature".to_string());
    let provided = STANDARD
        .decode(signature_header.trim())
        .map_err(|_| invalid())?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| invalid())?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| invalid())
}

/// Signature header value for `body`, as the CRM would send it.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::backend("init webhook hmac", e))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn parse_webhook(body: &[u8]) -> Result<WebhookEvent> {
    let env: Envelope = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidInput(format!("malformed webhook payload: {e}")))?;
    let raw = env.data.web_hook_event;
    if raw.topic.trim().is_empty() || raw.account_id.trim().is_empty() || raw.item_id.trim().is_empty() {
        return Err(Error::InvalidInput(
            "webhook topic, accountId and itemId are required".to_string(),
        ));
    }
    Ok(WebhookEvent {
        topic: raw.topic.trim().to_string(),
        account_id: AccountId(raw.account_id),
        item_id: raw.item_id,
        occurred_at: raw.occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"data":{"webHookEvent":{"topic":"JOB_UPDATE","appId":"app","accountId":"acc-1","itemId":"job-7","occurredAt":"2024-05-01T10:00:00Z"}}}"#;

    #[test]
    fn signature_roundtrip_and_tamper_detection() {
        let sig = sign_body("shh", BODY).unwrap();
        verify_signature("shh", &sig, BODY).unwrap();

        assert!(verify_signature("other", &sig, BODY).is_err());
        let mut tampered = BODY.to_vec();
        tampered[20] ^= 1;
        assert!(verify_signature("shh", &sig, &tampered).is_err());
        assert!(verify_signature("shh", "not base64!", BODY).is_err());
    }

    #[test]
    fn parses_event_envelope() {
        let e = parse_webhook(BODY).unwrap();
        assert_eq!(e.topic, "JOB_UPDATE");
        assert_eq!(e.account_id, AccountId("acc-1".into()));
        assert_eq!(e.item_id, "job-7");
        assert_eq!(e.occurred_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn rejects_incomplete_events() {
        assert!(matches!(
            parse_webhook(br#"{"data":{}}"#),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            parse_webhook(
                br#"{"data":{"webHookEvent":{"topic":"JOB_UPDATE","accountId":"","itemId":"j","occurredAt":"2024-05-01T10:00:00Z"}}}"#
            ),
            Err(Error::InvalidInput(_))
        ));
    }
}
