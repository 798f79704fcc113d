use crate::error::ApiError;
use crate::extract::MaybeUserIdHeader;
use crate::server::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use fieldsync_core::tokens::{sign_state, verify_state};
use fieldsync_core::{Error as CoreError, UserId};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/callback", get(callback))
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

/// Redirects the user's browser to the CRM consent screen.
#[tracing::instrument(level = "info", skip_all)]
pub async fn authorize(
    MaybeUserIdHeader(header_user): MaybeUserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<AuthorizeQuery>,
) -> Result<Response, ApiError> {
    let user_id = header_user.or(q.user_id).ok_or(ApiError::MissingUserId)?;
    if state.store.get_user(user_id).await?.is_none() {
        return Err(CoreError::NotFound(format!("user {user_id}")).into());
    }

    let signed = sign_state(&state.settings.oauth_state_secret, user_id, Utc::now())?;
    let url = state.oauth.authorize_url(&signed)?;
    tracing::info!(%user_id, "redirecting to crm authorization");
    Ok(found(&url))
}

/// Completes the authorization-code flow and stores the connection.
#[tracing::instrument(level = "info", skip_all)]
pub async fn callback(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(err) = q.error {
        let detail = q.error_description.unwrap_or_default();
        return Err(ApiError::InvalidInput(format!(
            "authorization was not granted: {err} {detail}"
        )));
    }
    let code = q
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidInput("missing code".to_string()))?;
    let signed = q
        .state
        .ok_or_else(|| ApiError::InvalidInput("missing state".to_string()))?;

    let user_id = verify_state(&state.settings.oauth_state_secret, &signed, Utc::now())?;
    let grant = state.tokens.provider().exchange_code(&code).await?;
    let account = state.crm.current_account(&grant.access_token).await?;
    let status = state.tokens.connect(user_id, account, grant).await?;
    tracing::info!(%user_id, account_id = ?status.account_id, "crm account connected");

    // Initial mirror of existing records; webhooks keep it current afterwards.
    let sync = state.sync.clone();
    tokio::spawn(async move {
        match sync.backfill_all(user_id).await {
            Ok(report) => tracing::info!(%user_id, total = report.total(), "initial backfill finished"),
            Err(e) => tracing::warn!(%user_id, error = %e, "initial backfill failed"),
        }
    });

    match state.settings.public_app_url.as_deref() {
        Some(app_url) => Ok(found(&format!("{}?crm=connected", app_url.trim_end_matches('/')))),
        None => Ok(Json(status).into_response()),
    }
}
