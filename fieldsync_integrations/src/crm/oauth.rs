//! OAuth 2.0 authorization-code flow against the external CRM.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, TimeZone, Utc};
use fieldsync_core::config::CrmConfig;
use fieldsync_core::tokens::{OAuthProvider, RefreshError, TokenGrant};
use fieldsync_core::{Error, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::instrument;

/// Lifetime assumed when the CRM states none.
pub const DEFAULT_TOKEN_TTL_MINUTES: i64 = 60;

const SERVICE: &str = "crm_oauth";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

#[derive(Clone)]
pub struct CrmOAuthClient {
    client: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    authorize_url: String,
    token_url: String,
}

impl CrmOAuthClient {
    pub fn new(cfg: &CrmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            client,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
            authorize_url: cfg.authorize_url.clone(),
            token_url: cfg.token_url.clone(),
        })
    }

    /// URL the user's browser is sent to for consent.
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| Error::backend("build authorize url", e))?;
        Ok(url.into())
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> std::result::Result<TokenGrant, RefreshError> {
        let resp = self
            .client
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let status = resp.status();
        let body = resp.text().await.map_err(Error::backend_reqwest)?;
        if status.is_success() {
            let parsed: TokenResponse = serde_json::from_str(&body)
                .map_err(|e| Error::backend("decode crm token response", e))?;
            return Ok(grant_from_response(parsed, Utc::now()));
        }
        Err(classify_token_error(status, &body))
    }
}

fn grant_from_response(resp: TokenResponse, now: DateTime<Utc>) -> TokenGrant {
    let expires_at = resp
        .expires_in
        .filter(|s| *s > 0)
        .map(|s| now + Duration::seconds(s))
        .or_else(|| jwt_expiry(&resp.access_token))
        .unwrap_or_else(|| now + Duration::minutes(DEFAULT_TOKEN_TTL_MINUTES));
    TokenGrant {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token.unwrap_or_default(),
        expires_at,
    }
}

/// `exp` claim of a JWT access token, without verifying the signature.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

fn classify_token_error(status: StatusCode, body: &str) -> RefreshError {
    let parsed: Option<TokenErrorResponse> = serde_json::from_str(body).ok();
    let auth_failure = matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED);
    match parsed {
        Some(e) if auth_failure && e.error == "invalid_grant" => RefreshError::InvalidGrant(
            e.error_description.unwrap_or(e.error),
        ),
        None if status == StatusCode::UNAUTHORIZED => {
            RefreshError::InvalidGrant("token endpoint answered 401".to_string())
        }
        Some(e) => RefreshError::Other(Error::upstream(
            SERVICE,
            status.as_u16(),
            e.error_description.unwrap_or(e.error),
        )),
        None => RefreshError::Other(Error::upstream(SERVICE, status.as_u16(), body.to_string())),
    }
}

#[async_trait]
impl OAuthProvider for CrmOAuthClient {
    #[instrument(level = "info", skip_all)]
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        self.token_request(&form).await.map_err(|e| match e {
            RefreshError::InvalidGrant(msg) => {
                Error::Unauthorized(format!("authorization code rejected: {msg}"))
            }
            RefreshError::Other(e) => e,
        })
    }

    #[instrument(level = "info", skip_all)]
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, RefreshError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        self.token_request(&form).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(server: &MockServer) -> CrmConfig {
        CrmConfig {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            redirect_uri: "https://app.test/oauth/callback".into(),
            authorize_url: format!("{}/oauth/authorize", server.uri()),
            token_url: format!("{}/oauth/token", server.uri()),
            graphql_url: format!("{}/graphql", server.uri()),
            api_version: "2024-01-01".into(),
            timeout: StdDuration::from_secs(5),
        }
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(json!({ "exp": exp }).to_string());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn expiry_falls_back_from_expires_in_to_jwt_to_default() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let g = grant_from_response(
            TokenResponse {
                access_token: "opaque".into(),
                refresh_token: Some("r".into()),
                expires_in: Some(3600),
            },
            now,
        );
        assert_eq!(g.expires_at, now + Duration::hours(1));

        let exp = now.timestamp() + 600;
        let g = grant_from_response(
            TokenResponse {
                access_token: jwt_with_exp(exp),
                refresh_token: None,
                expires_in: None,
            },
            now,
        );
        assert_eq!(g.expires_at.timestamp(), exp);
        assert_eq!(g.refresh_token, "");

        let g = grant_from_response(
            TokenResponse {
                access_token: "opaque".into(),
                refresh_token: None,
                expires_in: None,
            },
            now,
        );
        assert_eq!(g.expires_at, now + Duration::minutes(60));
    }

    #[tokio::test]
    async fn authorize_url_carries_client_and_state() {
        let server = MockServer::start().await;
        let oauth = CrmOAuthClient::new(&cfg(&server)).unwrap();
        let url = oauth.authorize_url("st.ate").unwrap();
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=st.ate"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapp.test%2Foauth%2Fcallback"));
    }

    #[tokio::test]
    async fn refresh_success_returns_new_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let oauth = CrmOAuthClient::new(&cfg(&server)).unwrap();
        let g = oauth.refresh("old").await.unwrap();
        assert_eq!(g.access_token, "new-access");
        assert_eq!(g.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn invalid_grant_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let oauth = CrmOAuthClient::new(&cfg(&server)).unwrap();
        match oauth.refresh("old").await {
            Err(RefreshError::InvalidGrant(msg)) => assert_eq!(msg, "refresh token revoked"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_are_not_invalid_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let oauth = CrmOAuthClient::new(&cfg(&server)).unwrap();
        assert!(matches!(
            oauth.refresh("old").await,
            Err(RefreshError::Other(Error::Upstream { status: 503, .. }))
        ));
    }

    #[test]
    fn unparseable_401_counts_as_invalid_grant() {
        assert!(matches!(
            classify_token_error(StatusCode::UNAUTHORIZED, "<html>"),
            RefreshError::InvalidGrant(_)
        ));
        assert!(matches!(
            classify_token_error(StatusCode::BAD_REQUEST, r#"{"error":"invalid_client"}"#),
            RefreshError::Other(_)
        ));
    }
}
