use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("empty id")]
    Empty,
}

/// Local application user (the person who connects a CRM account).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s.trim()).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Account identifier assigned by the external CRM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdParseError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An external CRM account and the local user currently connected to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmAccount {
    pub account_id: AccountId,
    pub name: String,
    pub connected_user_id: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}

/// Pagination for list endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl ListQuery {
    pub const MAX_LIMIT: usize = 500;

    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(100).clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// CRM entity types mirrored into the local store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Job,
    Quote,
    Invoice,
    Visit,
    Timesheet,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Client,
        EntityKind::Job,
        EntityKind::Quote,
        EntityKind::Invoice,
        EntityKind::Visit,
        EntityKind::Timesheet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Job => "job",
            EntityKind::Quote => "quote",
            EntityKind::Invoice => "invoice",
            EntityKind::Visit => "visit",
            EntityKind::Timesheet => "timesheet",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.plural() == s)
    }

    /// Path segment used by the HTTP API (`/clients`, `/jobs`, ...).
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Client => "clients",
            EntityKind::Job => "jobs",
            EntityKind::Quote => "quotes",
            EntityKind::Invoice => "invoices",
            EntityKind::Visit => "visits",
            EntityKind::Timesheet => "timesheets",
        }
    }

    /// Prefix of CRM webhook topics for this kind (`CLIENT_CREATE`, ...).
    pub fn topic_prefix(&self) -> &'static str {
        match self {
            EntityKind::Client => "CLIENT",
            EntityKind::Job => "JOB",
            EntityKind::Quote => "QUOTE",
            EntityKind::Invoice => "INVOICE",
            EntityKind::Visit => "VISIT",
            EntityKind::Timesheet => "TIMESHEET",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s).ok_or_else(|| Error::InvalidInput(format!("unknown entity kind: {s}")))
    }
}

/// A flattened CRM entity as persisted in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedEntity {
    pub kind: EntityKind,
    pub external_id: String,
    pub account_id: AccountId,
    pub data: serde_json::Value,
    /// Primary timestamp of the entity, used for range queries.
    pub occurred_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl SyncedEntity {
    pub fn from_record<T: crate::entities::EntityRecord>(
        account_id: AccountId,
        record: &T,
    ) -> Result<Self> {
        let data = serde_json::to_value(record)
            .map_err(|e| Error::backend(format!("serialize {}", T::KIND), e))?;
        Ok(Self {
            kind: T::KIND,
            external_id: record.external_id().to_string(),
            account_id,
            data,
            occurred_at: record.occurred_at(),
            remote_updated_at: record.remote_updated_at(),
            synced_at: Utc::now(),
        })
    }

    pub fn decode<T: crate::entities::EntityRecord>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(Error::InvalidInput(format!(
                "expected {} entity, got {}",
                T::KIND,
                self.kind
            )));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| Error::backend(format!("decode {} {}", self.kind, self.external_id), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parses_singular_and_plural() {
        assert_eq!(EntityKind::parse_str("client"), Some(EntityKind::Client));
        assert_eq!(EntityKind::parse_str("Timesheets"), Some(EntityKind::Timesheet));
        assert_eq!(EntityKind::parse_str("widgets"), None);
        assert!("nope".parse::<EntityKind>().is_err());
    }

    #[test]
    fn list_query_clamps_limit() {
        let q = ListQuery::new(Some(10_000), None);
        assert_eq!(q.limit, ListQuery::MAX_LIMIT);
        assert_eq!(ListQuery::new(Some(0), Some(5)).limit, 1);
        assert_eq!(ListQuery::new(None, Some(5)).offset, 5);
    }

    #[test]
    fn account_id_rejects_blank() {
        assert!("  ".parse::<AccountId>().is_err());
        assert_eq!("acc-1 ".parse::<AccountId>().unwrap().as_str(), "acc-1");
    }
}
