use crate::routes;
use axum::routing::get;
use axum::{Extension, Router};
use fieldsync_core::billing::PaymentsGateway;
use fieldsync_core::config::AppConfig;
use fieldsync_core::sync::CrmSource;
use fieldsync_core::{BillingService, InventoryService, KpiService, Store, SyncService, TokenManager};
use fieldsync_integrations::CrmOAuthClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Secrets and knobs the HTTP layer needs directly.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// HMAC key of CRM webhook bodies (the OAuth app's client secret).
    pub crm_webhook_secret: String,
    /// HMAC key of the OAuth `state` parameter.
    pub oauth_state_secret: String,
    pub payments_webhook_secret: Option<String>,
    pub api_token: Option<String>,
    pub webhook_max_payload_bytes: usize,
    pub public_app_url: Option<String>,
}

impl ServerSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            crm_webhook_secret: cfg.crm.client_secret.clone(),
            oauth_state_secret: cfg.crm.client_secret.clone(),
            payments_webhook_secret: cfg.payments.as_ref().and_then(|p| p.webhook_secret.clone()),
            api_token: cfg.api_token.clone(),
            webhook_max_payload_bytes: cfg.webhook_max_payload_bytes,
            public_app_url: cfg.public_app_url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub tokens: Arc<TokenManager>,
    pub crm: Arc<dyn CrmSource>,
    /// Builds consent URLs; code exchange goes through `tokens`.
    pub oauth: CrmOAuthClient,
    pub sync: SyncService,
    pub inventory: InventoryService,
    pub kpis: KpiService,
    /// `None` when no payments processor is configured.
    pub billing: Option<BillingService>,
    pub settings: ServerSettings,
    pub started_at: Instant,
}

impl AppState {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<TokenManager>,
        crm: Arc<dyn CrmSource>,
        oauth: CrmOAuthClient,
        payments: Option<(Arc<dyn PaymentsGateway>, String)>,
        settings: ServerSettings,
    ) -> Self {
        let sync = SyncService::new(store.clone(), tokens.clone(), crm.clone());
        let billing = payments
            .map(|(gateway, currency)| BillingService::new(store.clone(), gateway, currency));
        Self {
            inventory: InventoryService::new(store.clone()),
            kpis: KpiService::new(store.clone()),
            store,
            tokens,
            crm,
            oauth,
            sync,
            billing,
            settings,
            started_at: Instant::now(),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    let request_id = axum::http::HeaderName::from_static("x-request-id");

    Router::new()
        .merge(routes::router())
        .route("/health", get(routes::health::get_health))
        .layer(Extension(state))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "fieldsync listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
