use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use fieldsync_core::UserId;
use std::future;
use std::str::FromStr;

pub const USER_ID_HEADER: &str = "x-user-id";

fn parse_user_id(parts: &Parts) -> Result<Option<UserId>, ApiError> {
    let Some(raw) = parts.headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|e| ApiError::InvalidUserId(e.to_string()))?;
    let user_id = UserId::from_str(raw.trim()).map_err(|e| ApiError::InvalidUserId(e.to_string()))?;
    Ok(Some(user_id))
}

/// Calling user, from the required `x-user-id` header.
#[derive(Debug, Copy, Clone)]
pub struct UserIdHeader(pub UserId);

impl<S> FromRequestParts<S> for UserIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.user_id", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = parse_user_id(parts).and_then(|u| u.map(Self).ok_or(ApiError::MissingUserId));
        future::ready(res)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct MaybeUserIdHeader(pub Option<UserId>);

impl<S> FromRequestParts<S> for MaybeUserIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.maybe_user_id", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        future::ready(parse_user_id(parts).map(Self))
    }
}
