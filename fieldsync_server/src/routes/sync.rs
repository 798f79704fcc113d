use crate::error::ApiError;
use crate::extract::UserIdHeader;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Path;
use axum::routing::post;
use fieldsync_core::EntityKind;
use fieldsync_core::sync::BackfillReport;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct KindSyncResponse {
    pub kind: EntityKind,
    pub synced: usize,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/sync", post(sync_all))
        .route("/sync/{kind}", post(sync_kind))
}

/// Pulls every entity kind for the caller's connected account.
#[tracing::instrument(level = "info", skip_all)]
pub async fn sync_all(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<BackfillReport>, ApiError> {
    Ok(Json(state.sync.backfill_all(user_id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn sync_kind(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<KindSyncResponse>, ApiError> {
    let kind = EntityKind::from_str(&kind)?;
    let synced = state.sync.backfill(user_id, kind).await?;
    Ok(Json(KindSyncResponse { kind, synced }))
}
