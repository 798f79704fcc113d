use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::routing::post;
use chrono::Utc;
use fieldsync_core::Error as CoreError;
use fieldsync_integrations::{crm, payments};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/webhooks/crm", post(crm_webhook))
        .route("/webhooks/payments", post(payments_webhook))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::Core(CoreError::Unauthorized(format!("missing {name} header")))
        })
}

fn check_size(state: &AppState, body: &Bytes) -> Result<(), ApiError> {
    let max = state.settings.webhook_max_payload_bytes;
    if body.len() > max {
        return Err(ApiError::PayloadTooLarge(max));
    }
    Ok(())
}

/// Verifies and acknowledges a CRM change notification.
///
/// The fetch/upsert runs in the background so the CRM gets its 200 quickly;
/// failures are recorded on the webhook receipt.
#[tracing::instrument(level = "info", skip_all)]
pub async fn crm_webhook(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    check_size(&state, &body)?;
    let signature = header_str(&headers, crm::SIGNATURE_HEADER)?;
    crm::verify_signature(&state.settings.crm_webhook_secret, signature, &body)?;
    let event = crm::parse_webhook(&body)?;

    let sync = state.sync.clone();
    tokio::spawn(async move {
        if let Err(e) = sync.handle_webhook(&event).await {
            tracing::warn!(topic = %event.topic, item_id = %event.item_id, error = %e, "webhook processing failed");
        }
    });

    Ok(Json(WebhookAck { received: true }))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn payments_webhook(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::BillingDisabled)?;
    check_size(&state, &body)?;
    let secret = state
        .settings
        .payments_webhook_secret
        .as_deref()
        .ok_or_else(|| {
            ApiError::Core(CoreError::Unauthorized(
                "payments webhook secret is not configured".to_string(),
            ))
        })?;
    let signature = header_str(&headers, payments::SIGNATURE_HEADER)?;
    payments::verify_signature(
        secret,
        signature,
        &body,
        Utc::now(),
        payments::DEFAULT_TOLERANCE_SECS,
    )?;

    let event = payments::parse_event(&body)?;
    billing.apply_event(&event).await?;
    Ok(Json(WebhookAck { received: true }))
}
