use std::error::Error as StdError;

/// Common error type for `fieldsync_core`.
///
/// Store and HTTP client implementations should preserve the underlying error
/// chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Stored CRM credentials are gone or unusable; the user has to run the
    /// OAuth flow again.
    #[error("reconnect required: {0}")]
    ReconnectRequired(String),

    #[error("{service} returned {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    pub fn upstream(service: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            status,
            message: message.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
