use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    Postgres(PostgresConfig),
    /// Single-file SQLite database (dev / single-node).
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub client_id: String,
    /// Also the HMAC key the CRM signs webhook bodies with.
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub graphql_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub api_base: String,
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub currency: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Tokens expiring within this window are refreshed before use.
    pub refresh_skew: Duration,
    pub master_key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub crm: CrmConfig,
    /// Billing routes are disabled when no payments key is configured.
    pub payments: Option<PaymentsConfig>,
    pub tokens: TokenConfig,
    pub api_token: Option<String>,
    pub webhook_max_payload_bytes: usize,
    pub public_app_url: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> Result<String> {
    env_opt(key).ok_or_else(|| Error::InvalidInput(format!("{key} is required")))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

impl DatabaseConfig {
    /// `postgres://` URLs select Postgres; anything else is a SQLite path.
    /// Without a URL the SQLite file lives under `data_dir`.
    pub fn from_url(url: Option<String>, data_dir: &Path) -> Self {
        match url {
            Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                DatabaseConfig::Postgres(PostgresConfig {
                    url,
                    max_connections: env_parse("FIELDSYNC_DB_MAX_CONNECTIONS", 10),
                    acquire_timeout: Duration::from_millis(env_parse(
                        "FIELDSYNC_DB_ACQUIRE_TIMEOUT_MS",
                        5_000,
                    )),
                })
            }
            Some(url) => {
                let path = url
                    .strip_prefix("sqlite://")
                    .or_else(|| url.strip_prefix("sqlite:"))
                    .unwrap_or(&url);
                DatabaseConfig::Sqlite {
                    path: PathBuf::from(path),
                }
            }
            None => DatabaseConfig::Sqlite {
                path: data_dir.join("fieldsync.db"),
            },
        }
    }
}

impl AppConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env(data_dir: PathBuf) -> Result<Self> {
        let data_dir = env_opt("FIELDSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(data_dir);

        let database = DatabaseConfig::from_url(env_opt("DATABASE_URL"), &data_dir);

        let crm = CrmConfig {
            client_id: env_required("FIELDSYNC_CRM_CLIENT_ID")?,
            client_secret: env_required("FIELDSYNC_CRM_CLIENT_SECRET")?,
            redirect_uri: env_required("FIELDSYNC_CRM_REDIRECT_URI")?,
            authorize_url: env_required("FIELDSYNC_CRM_AUTHORIZE_URL")?,
            token_url: env_required("FIELDSYNC_CRM_TOKEN_URL")?,
            graphql_url: env_required("FIELDSYNC_CRM_GRAPHQL_URL")?,
            api_version: env_opt("FIELDSYNC_CRM_API_VERSION")
                .unwrap_or_else(|| "2024-01-01".to_string()),
            timeout: Duration::from_millis(env_parse("FIELDSYNC_CRM_TIMEOUT_MS", 20_000)),
        };

        let payments = env_opt("FIELDSYNC_PAYMENTS_SECRET_KEY").map(|secret_key| PaymentsConfig {
            api_base: env_opt("FIELDSYNC_PAYMENTS_API_BASE")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            secret_key,
            webhook_secret: env_opt("FIELDSYNC_PAYMENTS_WEBHOOK_SECRET"),
            currency: env_opt("FIELDSYNC_PAYMENTS_CURRENCY")
                .unwrap_or_else(|| "usd".to_string())
                .to_ascii_lowercase(),
            timeout: Duration::from_millis(env_parse("FIELDSYNC_PAYMENTS_TIMEOUT_MS", 20_000)),
        });

        let tokens = TokenConfig {
            refresh_skew: Duration::from_secs(env_parse("FIELDSYNC_TOKEN_REFRESH_SKEW_SECS", 300)),
            master_key_path: env_opt("FIELDSYNC_MASTER_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("master.key")),
        };

        let cfg = Self {
            data_dir,
            database,
            crm,
            payments,
            tokens,
            api_token: env_opt("FIELDSYNC_API_TOKEN"),
            webhook_max_payload_bytes: env_parse("FIELDSYNC_WEBHOOK_MAX_PAYLOAD_BYTES", 1_000_000),
            public_app_url: env_opt("FIELDSYNC_PUBLIC_APP_URL"),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        match &self.database {
            DatabaseConfig::Postgres(pg) => {
                if pg.url.trim().is_empty() {
                    return Err(Error::InvalidInput("postgres.url is empty".to_string()));
                }
                if pg.max_connections == 0 {
                    return Err(Error::InvalidInput(
                        "postgres.max_connections must be > 0".to_string(),
                    ));
                }
                if pg.acquire_timeout.is_zero() {
                    return Err(Error::InvalidInput(
                        "postgres.acquire_timeout must be > 0".to_string(),
                    ));
                }
            }
            DatabaseConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::InvalidInput("sqlite path is empty".to_string()));
                }
            }
        }

        for (name, value) in [
            ("crm.client_id", &self.crm.client_id),
            ("crm.client_secret", &self.crm.client_secret),
            ("crm.redirect_uri", &self.crm.redirect_uri),
            ("crm.authorize_url", &self.crm.authorize_url),
            ("crm.token_url", &self.crm.token_url),
            ("crm.graphql_url", &self.crm.graphql_url),
            ("crm.api_version", &self.crm.api_version),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{name} is empty")));
            }
        }
        if self.crm.timeout.is_zero() {
            return Err(Error::InvalidInput("crm.timeout must be > 0".to_string()));
        }

        if let Some(p) = &self.payments {
            if p.api_base.trim().is_empty() {
                return Err(Error::InvalidInput("payments.api_base is empty".to_string()));
            }
            if p.currency.len() != 3 {
                return Err(Error::InvalidInput(format!(
                    "payments.currency must be a 3-letter ISO code, got {}",
                    p.currency
                )));
            }
        }

        if self.tokens.refresh_skew > Duration::from_secs(3_600) {
            return Err(Error::InvalidInput(
                "tokens.refresh_skew must be <= 1h".to_string(),
            ));
        }
        if self.webhook_max_payload_bytes == 0 {
            return Err(Error::InvalidInput(
                "webhook_max_payload_bytes must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            data_dir: PathBuf::from(".fieldsync"),
            database: DatabaseConfig::Sqlite {
                path: PathBuf::from(".fieldsync/fieldsync.db"),
            },
            crm: CrmConfig {
                client_id: "id".into(),
                client_secret: "secret".into(),
                redirect_uri: "http://localhost:8000/oauth/callback".into(),
                authorize_url: "https://crm.example/oauth/authorize".into(),
                token_url: "https://crm.example/oauth/token".into(),
                graphql_url: "https://crm.example/graphql".into(),
                api_version: "2024-01-01".into(),
                timeout: Duration::from_secs(20),
            },
            payments: None,
            tokens: TokenConfig {
                refresh_skew: Duration::from_secs(300),
                master_key_path: PathBuf::from(".fieldsync/master.key"),
            },
            api_token: None,
            webhook_max_payload_bytes: 1_000_000,
            public_app_url: None,
        }
    }

    #[test]
    fn database_url_selects_backend() {
        let dir = PathBuf::from("/tmp/fs");
        assert!(matches!(
            DatabaseConfig::from_url(Some("postgres://u@h/db".into()), &dir),
            DatabaseConfig::Postgres(_)
        ));
        match DatabaseConfig::from_url(Some("sqlite:///var/lib/fs.db".into()), &dir) {
            DatabaseConfig::Sqlite { path } => assert_eq!(path, PathBuf::from("/var/lib/fs.db")),
            other => panic!("unexpected: {other:?}"),
        }
        match DatabaseConfig::from_url(None, &dir) {
            DatabaseConfig::Sqlite { path } => assert_eq!(path, dir.join("fieldsync.db")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sample_config_is_valid() {
        sample().validate().unwrap();
    }

    #[test]
    fn blank_crm_field_is_rejected() {
        let mut cfg = sample();
        cfg.crm.graphql_url = "  ".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("crm.graphql_url"));
    }

    #[test]
    fn payments_currency_must_be_iso() {
        let mut cfg = sample();
        cfg.payments = Some(PaymentsConfig {
            api_base: "https://api.stripe.com".into(),
            secret_key: "sk_test".into(),
            webhook_secret: None,
            currency: "dollars".into(),
            timeout: Duration::from_secs(5),
        });
        assert!(cfg.validate().is_err());
    }
}
