use crate::server::AppState;
use axum::Extension;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_ms: u64,
    pub billing_enabled: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_ms: u64::try_from(state.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        billing_enabled: state.billing.is_some(),
    })
}
