use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use fieldsync_core::ListQuery;
use fieldsync_core::inventory::{
    InventoryItem, InventoryItemPatch, InventoryMovement, MovementReason, NewInventoryItem,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListItemsQuery {
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub delta: i64,
    #[serde(default = "default_reason")]
    pub reason: MovementReason,
    #[serde(default)]
    pub job_external_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

fn default_reason() -> MovementReason {
    MovementReason::Adjustment
}

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub quantity: i64,
    pub job_external_id: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MovementsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/inventory/items", post(create_item).get(list_items))
        .route(
            "/inventory/items/{id}",
            get(get_item).patch(update_item).delete(archive_item),
        )
        .route("/inventory/items/{id}/adjust", post(adjust))
        .route("/inventory/items/{id}/usage", post(record_usage))
        .route("/inventory/items/{id}/movements", get(list_movements))
        .route("/inventory/low-stock", get(low_stock))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create_item(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<NewInventoryItem>,
) -> Result<(StatusCode, Json<InventoryItem>), ApiError> {
    let item = state.inventory.create_item(req).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_items(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<ListItemsQuery>,
) -> Result<Json<Vec<InventoryItem>>, ApiError> {
    Ok(Json(state.inventory.list_items(q.include_archived).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_item(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InventoryItem>, ApiError> {
    Ok(Json(state.inventory.get_item(id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn update_item(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<InventoryItemPatch>,
) -> Result<Json<InventoryItem>, ApiError> {
    Ok(Json(state.inventory.update_item(id, patch).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn archive_item(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<InventoryItem>, ApiError> {
    Ok(Json(state.inventory.archive_item(id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn adjust(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdjustRequest>,
) -> Result<Json<InventoryItem>, ApiError> {
    if req.reason == MovementReason::JobUsage {
        return Err(ApiError::InvalidInput(
            "job usage is recorded through /usage".to_string(),
        ));
    }
    let item = state
        .inventory
        .adjust(id, req.delta, req.reason, req.job_external_id, req.note)
        .await?;
    Ok(Json(item))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn record_usage(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UsageRequest>,
) -> Result<Json<InventoryItem>, ApiError> {
    let item = state
        .inventory
        .record_usage(id, req.quantity, req.job_external_id.trim(), req.note)
        .await?;
    Ok(Json(item))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_movements(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<MovementsQuery>,
) -> Result<Json<Vec<InventoryMovement>>, ApiError> {
    let movements = state
        .inventory
        .movements(id, ListQuery::new(q.limit, q.offset))
        .await?;
    Ok(Json(movements))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn low_stock(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<InventoryItem>>, ApiError> {
    Ok(Json(state.inventory.low_stock().await?))
}
