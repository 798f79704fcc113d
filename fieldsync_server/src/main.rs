use clap::Parser;
use fieldsync_core::config::{AppConfig, DatabaseConfig};
use fieldsync_core::{EntityKind, ListQuery};
use fieldsync_server::cli::{Cli, Commands};
use std::net::SocketAddr;

fn redact(s: &str) -> String {
    if s.len() <= 8 {
        return "***".to_string();
    }
    match (s.get(..4), s.get(s.len() - 4..)) {
        (Some(head), Some(tail)) => format!("{head}***{tail}"),
        _ => "***".to_string(),
    }
}

fn database_url_from_env() -> Option<String> {
    std::env::var("DATABASE_URL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fieldsync_core::telemetry::init_from_env()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(Commands::default_serve) {
        Commands::Serve {
            host,
            port,
            data_dir,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let cfg = AppConfig::from_env(data_dir)?;
            let state = fieldsync_server::backends::build_state(&cfg).await?;
            fieldsync_server::server::serve(addr, state).await?;
        }
        Commands::Migrate {
            database_url,
            data_dir,
        } => {
            let db = DatabaseConfig::from_url(database_url.or_else(database_url_from_env), &data_dir);
            fieldsync_server::backends::open_store(&db).await?;
            tracing::info!("database schema applied");
        }
        Commands::Config { data_dir } => {
            let cfg = AppConfig::from_env(data_dir)?;
            let database = match &cfg.database {
                DatabaseConfig::Postgres(pg) => serde_json::json!({
                    "backend": "postgres",
                    "url": redact(&pg.url),
                    "max_connections": pg.max_connections,
                }),
                DatabaseConfig::Sqlite { path } => serde_json::json!({
                    "backend": "sqlite",
                    "path": path.display().to_string(),
                }),
            };
            let out = serde_json::json!({
                "data_dir": cfg.data_dir.display().to_string(),
                "database": database,
                "crm": {
                    "client_id": cfg.crm.client_id,
                    "client_secret": redact(&cfg.crm.client_secret),
                    "redirect_uri": cfg.crm.redirect_uri,
                    "authorize_url": cfg.crm.authorize_url,
                    "token_url": cfg.crm.token_url,
                    "graphql_url": cfg.crm.graphql_url,
                    "api_version": cfg.crm.api_version,
                },
                "payments": cfg.payments.as_ref().map(|p| serde_json::json!({
                    "api_base": p.api_base,
                    "secret_key": redact(&p.secret_key),
                    "webhook_secret": p.webhook_secret.as_deref().map(redact),
                    "currency": p.currency,
                })),
                "tokens": {
                    "refresh_skew_secs": cfg.tokens.refresh_skew.as_secs(),
                    "master_key_path": cfg.tokens.master_key_path.display().to_string(),
                },
                "api_token": cfg.api_token.as_deref().map(|_| "<set>"),
                "webhook_max_payload_bytes": cfg.webhook_max_payload_bytes,
                "public_app_url": cfg.public_app_url,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Check { data_dir } => {
            let db = DatabaseConfig::from_url(database_url_from_env(), &data_dir);
            let backend = match &db {
                DatabaseConfig::Postgres(_) => "postgres",
                DatabaseConfig::Sqlite { .. } => "sqlite",
            };
            match fieldsync_server::backends::open_store(&db).await {
                Ok(store) => match store.list_users(ListQuery::new(Some(1), None)).await {
                    Ok(_) => {
                        println!("{backend}: ok");
                        for kind in EntityKind::ALL {
                            match store.count_entities(kind).await {
                                Ok(n) => println!("  {}: {n}", kind.plural()),
                                Err(e) => println!("  {}: error ({e})", kind.plural()),
                            }
                        }
                    }
                    Err(e) => println!("{backend}: error ({e})"),
                },
                Err(e) => println!("{backend}: error ({e})"),
            }

            match AppConfig::from_env(data_dir) {
                Ok(cfg) => {
                    println!("crm: configured ({})", cfg.crm.graphql_url);
                    println!(
                        "payments: {}",
                        if cfg.payments.is_some() {
                            "configured"
                        } else {
                            "not configured"
                        }
                    );
                }
                Err(e) => println!("config: error ({e})"),
            }
        }
    }

    Ok(())
}
