use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fieldsync_core::error as core_error;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    /// Set when the caller has to run the OAuth flow again.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reconnect_required: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("missing x-user-id header")]
    MissingUserId,

    #[error("invalid x-user-id header: {0}")]
    InvalidUserId(String),

    #[error("{0}")]
    Core(#[from] fieldsync_core::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("billing is not configured")]
    BillingDisabled,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingUserId | ApiError::InvalidUserId(_) | ApiError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::BillingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Core(err) => match err {
                core_error::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
                core_error::Error::NotFound(_) => StatusCode::NOT_FOUND,
                core_error::Error::Conflict(_) => StatusCode::CONFLICT,
                core_error::Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                core_error::Error::ReconnectRequired(_) => StatusCode::CONFLICT,
                core_error::Error::Upstream { .. }
                | core_error::Error::Backend { .. }
                | core_error::Error::BackendMessage(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            reconnect_required: matches!(
                self,
                ApiError::Core(core_error::Error::ReconnectRequired(_))
            ),
        };
        (code, Json(body)).into_response()
    }
}
