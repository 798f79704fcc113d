use fieldsync_core::billing::PaymentsGateway;
use fieldsync_core::config::{AppConfig, DatabaseConfig};
use fieldsync_core::sync::CrmSource;
use fieldsync_core::tokens::OAuthProvider;
use fieldsync_core::{PostgresStore, SqliteStore, Store, TokenCipher, TokenManager};
use fieldsync_integrations::{CrmClient, CrmOAuthClient, PaymentsClient};
use std::sync::Arc;

use crate::server::{AppState, ServerSettings};

/// Opens the configured store. Postgres migrations run on connect; SQLite
/// applies its schema when the file is opened.
#[tracing::instrument(level = "info", skip_all)]
pub async fn open_store(db: &DatabaseConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match db {
        DatabaseConfig::Postgres(cfg) => {
            let store = PostgresStore::connect(cfg).await?;
            store.migrate().await?;
            tracing::info!("using postgres store");
            Arc::new(store)
        }
        DatabaseConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            tracing::info!(path = %path.display(), "using sqlite store");
            Arc::new(store)
        }
    };
    Ok(store)
}

/// Wires the production store, CRM clients and (optional) payments processor.
#[tracing::instrument(level = "info", skip_all)]
pub async fn build_state(cfg: &AppConfig) -> anyhow::Result<AppState> {
    tokio::fs::create_dir_all(&cfg.data_dir).await?;

    let store = open_store(&cfg.database).await?;

    let master_key = TokenCipher::generate_or_load_key(&cfg.tokens.master_key_path)
        .map_err(|e| anyhow::anyhow!("master key: {e}"))?;
    let cipher = TokenCipher::new(&master_key);

    let oauth = CrmOAuthClient::new(&cfg.crm)?;
    let provider: Arc<dyn OAuthProvider> = Arc::new(oauth.clone());
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        cipher,
        provider,
        cfg.tokens.refresh_skew,
    ));
    let crm: Arc<dyn CrmSource> = Arc::new(CrmClient::new(&cfg.crm)?);

    let payments = match &cfg.payments {
        Some(p) => {
            let gateway: Arc<dyn PaymentsGateway> = Arc::new(PaymentsClient::new(p)?);
            Some((gateway, p.currency.clone()))
        }
        None => {
            tracing::info!("payments not configured; billing routes disabled");
            None
        }
    };

    Ok(AppState::new(
        store,
        tokens,
        crm,
        oauth,
        payments,
        ServerSettings::from_config(cfg),
    ))
}
