//! Signed OAuth `state` parameter.
//!
//! Format: `<user_id>.<issued_unix>.<nonce_hex>.<sig_hex>` where `sig` is
//! HMAC-SHA256 over everything before the last dot.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::models::UserId;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// How long an authorization round-trip may take.
pub const STATE_MAX_AGE_SECS: i64 = 15 * 60;

#[tracing::instrument(level = "debug", skip(secret))]
pub fn sign_state(secret: &str, user_id: UserId, now: DateTime<Utc>) -> Result<String> {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let payload = format!("{user_id}.{}.{}", now.timestamp(), hex::encode(nonce));
    let sig = mac_hex(secret, &payload)?;
    Ok(format!("{payload}.{sig}"))
}

/// Returns the user the state was issued for.
#[tracing::instrument(level = "debug", skip(secret))]
pub fn verify_state(secret: &str, state: &str, now: DateTime<Utc>) -> Result<UserId> {
    let (payload, sig_hex) = state
        .rsplit_once('.')
        .ok_or_else(|| Error::Unauthorized("malformed oauth state".to_string()))?;
    let provided =
        hex::decode(sig_hex).map_err(|_| Error::Unauthorized("malformed oauth state".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::BackendMessage(format!("hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| Error::Unauthorized("oauth state signature mismatch".to_string()))?;

    let mut parts = payload.splitn(3, '.');
    let user_part = parts.next().unwrap_or_default();
    let issued: i64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Unauthorized("malformed oauth state".to_string()))?;
    if now.timestamp() - issued > STATE_MAX_AGE_SECS {
        return Err(Error::Unauthorized("oauth state expired".to_string()));
    }

    user_part
        .parse()
        .map_err(|_| Error::Unauthorized("malformed oauth state".to_string()))
}

fn mac_hex(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::BackendMessage(format!("hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn state_verifies_for_issuing_user() {
        let user = UserId(Uuid::new_v4());
        let now = Utc::now();
        let state = sign_state("secret", user, now).unwrap();
        assert_eq!(verify_state("secret", &state, now).unwrap(), user);
    }

    #[test]
    fn tampered_or_foreign_state_is_rejected() {
        let user = UserId(Uuid::new_v4());
        let now = Utc::now();
        let state = sign_state("secret", user, now).unwrap();

        assert!(matches!(
            verify_state("other-secret", &state, now),
            Err(Error::Unauthorized(_))
        ));

        let other = UserId(Uuid::new_v4());
        let forged = state.replacen(&user.to_string(), &other.to_string(), 1);
        assert!(verify_state("secret", &forged, now).is_err());
        assert!(verify_state("secret", "garbage", now).is_err());
    }

    #[test]
    fn stale_state_is_rejected() {
        let user = UserId(Uuid::new_v4());
        let issued = Utc::now() - Duration::hours(1);
        let state = sign_state("secret", user, issued).unwrap();
        assert!(matches!(
            verify_state("secret", &state, Utc::now()),
            Err(Error::Unauthorized(_))
        ));
    }
}
