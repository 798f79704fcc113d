use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Query;
use axum::routing::get;
use chrono::{DateTime, Duration, Utc};
use fieldsync_core::TeamKpis;
use serde::Deserialize;
use std::sync::Arc;

/// Window used when the caller gives no `from`.
const DEFAULT_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct TeamKpisQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/kpis/team", get(team_kpis))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn team_kpis(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<TeamKpisQuery>,
) -> Result<Json<TeamKpis>, ApiError> {
    let to = q.to.unwrap_or_else(Utc::now);
    let from = q.from.unwrap_or(to - Duration::days(DEFAULT_WINDOW_DAYS));
    Ok(Json(state.kpis.team_kpis(from, to).await?))
}
