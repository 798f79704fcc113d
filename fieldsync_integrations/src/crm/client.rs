//! GraphQL client for the external CRM.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fieldsync_core::config::CrmConfig;
use fieldsync_core::sync::{CrmSource, EntityPage, FetchedEntity};
use fieldsync_core::{AccountId, CrmAccount, EntityKind, Error, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use super::mapping::flatten;
use super::queries::{self, ACCOUNT_QUERY, PAGE_SIZE};

/// Header carrying the pinned GraphQL schema version.
pub const VERSION_HEADER: &str = "x-graphql-version";

const SERVICE: &str = "crm";

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(default)]
    extensions: Option<GraphqlErrorExtensions>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorExtensions {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    #[serde(default)]
    nodes: Vec<serde_json::Value>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct AccountData {
    account: AccountNode,
}

#[derive(Debug, Deserialize)]
struct AccountNode {
    id: String,
    name: String,
}

#[derive(Clone)]
pub struct CrmClient {
    client: Client,
    graphql_url: String,
    api_version: String,
}

impl CrmClient {
    pub fn new(cfg: &CrmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            client,
            graphql_url: cfg.graphql_url.clone(),
            api_version: cfg.api_version.clone(),
        })
    }

    /// Client against an arbitrary endpoint (tests, staging).
    pub fn with_endpoint(graphql_url: impl Into<String>, api_version: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(Error::backend_reqwest)?;
        Ok(Self {
            client,
            graphql_url: graphql_url.into(),
            api_version: api_version.into(),
        })
    }

    /// Posts `{query, variables}` and decodes `data` into `T`.
    #[instrument(level = "debug", skip(self, access_token, query, variables))]
    pub async fn graphql<T: DeserializeOwned>(
        &self,
        access_token: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .client
            .post(&self.graphql_url)
            .bearer_auth(access_token)
            .header(VERSION_HEADER, &self.api_version)
            .json(&serde_json::json!({
                "query": query,
                "variables": variables,
            }))
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized("crm rejected access token".to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(SERVICE, status.as_u16(), truncate(&body, 500)));
        }

        let parsed: GraphqlResponse<T> = resp.json().await.map_err(Error::backend_reqwest)?;
        if !parsed.errors.is_empty() {
            return Err(graphql_errors(status, &parsed.errors));
        }
        parsed
            .data
            .ok_or_else(|| Error::BackendMessage("crm response had no data".to_string()))
    }
}

fn graphql_errors(status: StatusCode, errors: &[GraphqlError]) -> Error {
    let code = |e: &GraphqlError| e.extensions.as_ref().and_then(|x| x.code.clone());
    let joined = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    if errors.iter().any(|e| code(e).as_deref() == Some("THROTTLED")) {
        return Error::upstream(SERVICE, StatusCode::TOO_MANY_REQUESTS.as_u16(), format!("throttled: {joined}"));
    }
    if errors
        .iter()
        .any(|e| matches!(code(e).as_deref(), Some("UNAUTHENTICATED") | Some("UNAUTHORIZED")))
    {
        return Error::Unauthorized(joined);
    }
    Error::upstream(SERVICE, status.as_u16(), joined)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[async_trait]
impl CrmSource for CrmClient {
    #[instrument(level = "debug", skip(self, access_token))]
    async fn fetch_entity(
        &self,
        access_token: &str,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<FetchedEntity>> {
        let q = queries::for_kind(kind);
        let mut data: serde_json::Map<String, serde_json::Value> = self
            .graphql(access_token, &q.single(), serde_json::json!({ "id": external_id }))
            .await?;

        match data.remove(q.single_field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(node) => flatten(kind, node).map(Some),
        }
    }

    #[instrument(level = "debug", skip(self, access_token))]
    async fn list_page(
        &self,
        access_token: &str,
        kind: EntityKind,
        after: Option<&str>,
    ) -> Result<EntityPage> {
        let q = queries::for_kind(kind);
        let mut data: serde_json::Map<String, serde_json::Value> = self
            .graphql(
                access_token,
                &q.list(),
                serde_json::json!({ "first": PAGE_SIZE, "after": after }),
            )
            .await?;

        let conn = data
            .remove(q.list_field)
            .ok_or_else(|| Error::BackendMessage(format!("crm response missing {}", q.list_field)))?;
        let conn: Connection = serde_json::from_value(conn)
            .map_err(|e| Error::backend(format!("decode crm {} page", kind), e))?;

        let entities = conn
            .nodes
            .into_iter()
            .map(|node| flatten(kind, node))
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = if conn.page_info.has_next_page {
            conn.page_info.end_cursor
        } else {
            None
        };
        Ok(EntityPage {
            entities,
            next_cursor,
        })
    }

    #[instrument(level = "debug", skip_all)]
    async fn current_account(&self, access_token: &str) -> Result<CrmAccount> {
        let data: AccountData = self
            .graphql(access_token, ACCOUNT_QUERY, serde_json::json!({}))
            .await?;
        Ok(CrmAccount {
            account_id: AccountId(data.account.id),
            name: data.account.name,
            connected_user_id: None,
            updated_at: Utc::now(),
        })
    }
}
