use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::body::Body;
use axum::http::Request;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use fieldsync_core::Error as CoreError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")))
        .map(str::trim)
}

/// Constant-time: both values are MACed and the tags checked with `verify_slice`.
fn token_matches(expected: &str, got: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    mac.update(expected.as_bytes());
    let tag = mac.finalize().into_bytes();

    let Ok(mut mac) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    mac.update(got.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

/// Requires `Authorization: Bearer <FIELDSYNC_API_TOKEN>` on `/api/v1`.
///
/// Open when no token is configured (local development).
pub async fn require_api_token(
    Extension(state): Extension<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.api_token.as_deref() else {
        return next.run(req).await;
    };

    match bearer_token(&req) {
        Some(got) if token_matches(expected, got) => next.run(req).await,
        Some(_) => {
            ApiError::Core(CoreError::Unauthorized("invalid api token".to_string())).into_response()
        }
        None => ApiError::Core(CoreError::Unauthorized("missing bearer token".to_string()))
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cret", "s3creT"));
        assert!(!token_matches("s3cret", "s3cret-longer"));
        assert!(!token_matches("s3cret", ""));
    }
}
