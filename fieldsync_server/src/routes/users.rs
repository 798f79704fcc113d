use crate::error::ApiError;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post};
use chrono::Utc;
use fieldsync_core::{Error as CoreError, ListQuery, UserId, UserRecord};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/{id}", get(get_user))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn create_user(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserRecord>), ApiError> {
    let email = req.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::InvalidInput("a valid email is required".to_string()));
    }
    let user = UserRecord {
        user_id: UserId(Uuid::new_v4()),
        email,
        name: req
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        created_at: Utc::now(),
    };
    state.store.upsert_user(&user).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_user(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<UserId>,
) -> Result<Json<UserRecord>, ApiError> {
    let user = state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("user {id}")))?;
    Ok(Json(user))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_users(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<ListUsersQuery>,
) -> Result<Json<Vec<UserRecord>>, ApiError> {
    let users = state
        .store
        .list_users(ListQuery::new(q.limit, q.offset))
        .await?;
    Ok(Json(users))
}
