use axum::Router;
use axum::middleware;
use axum::routing::get;

pub mod billing;
pub mod connection;
pub mod entities;
pub mod health;
pub mod inventory;
pub mod kpis;
pub mod oauth;
pub mod sync;
pub mod users;
pub mod webhooks;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .merge(oauth::router())
        .merge(webhooks::router())
        .merge(api_v1_router())
}

#[tracing::instrument(level = "debug", skip_all)]
fn api_v1_router() -> Router {
    Router::new().nest(
        "/api/v1",
        Router::new()
            .route("/health", get(health::get_health))
            .merge(users::router())
            .merge(connection::router())
            .merge(entities::router())
            .merge(sync::router())
            .merge(inventory::router())
            .merge(kpis::router())
            .merge(billing::router())
            .layer(middleware::from_fn(crate::middleware::require_api_token)),
    )
}
