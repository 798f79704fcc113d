//! Global tracing setup.
//!
//! JSON logs to stdout by default; `FIELDSYNC_LOG_FORMAT=pretty` switches to
//! the human-readable formatter. Filtering follows `RUST_LOG` (default `info`).

use crate::{Error, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("FIELDSYNC_LOG_FORMAT")
            .ok()
            .and_then(|v| Self::parse_str(&v))
            .unwrap_or(Self::Json)
    }
}

pub fn init_from_env() -> Result<()> {
    init(LogFormat::from_env())
}

pub fn init(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let res = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}
