use crate::error::ApiError;
use crate::extract::UserIdHeader;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::routing::get;
use fieldsync_core::tokens::ConnectionStatus;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub disconnected: bool,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/connection", get(get_connection).delete(disconnect))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_connection(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<ConnectionStatus>, ApiError> {
    Ok(Json(state.tokens.status(user_id).await?))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn disconnect(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let disconnected = state.tokens.disconnect(user_id).await?;
    Ok(Json(DisconnectResponse { disconnected }))
}
