use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::EntityRecord;
use crate::models::{AccountId, EntityKind, SyncedEntity};
use crate::{Error, Result};

/// Change notification delivered by the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub topic: String,
    pub account_id: AccountId,
    pub item_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Deliveries may repeat; the same change always yields the same key.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.topic,
            self.item_id,
            self.occurred_at.timestamp_millis()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    Upsert,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookTopic {
    pub kind: EntityKind,
    pub action: WebhookAction,
}

impl WebhookTopic {
    /// Parses topics such as `CLIENT_CREATE`, `VISIT_COMPLETE` or `JOB_DESTROY`.
    ///
    /// Returns `None` for topics about entities that are not mirrored
    /// (e.g. `APP_CONNECT`, `PROPERTY_UPDATE`).
    pub fn parse(topic: &str) -> Option<Self> {
        let topic = topic.trim().to_ascii_uppercase();
        let (prefix, verb) = topic.split_once('_')?;
        let kind = EntityKind::ALL
            .into_iter()
            .find(|k| k.topic_prefix() == prefix)?;
        let action = match verb {
            "DESTROY" | "DELETE" => WebhookAction::Destroy,
            "" => return None,
            _ => WebhookAction::Upsert,
        };
        Some(Self { kind, action })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Done,
    Skipped,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Done => "done",
            ReceiptStatus::Skipped => "skipped",
            ReceiptStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A `pending` receipt older than this is treated as an interrupted attempt.
pub const PENDING_RECEIPT_TIMEOUT_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookReceipt {
    pub dedupe_key: String,
    pub topic: String,
    pub account_id: AccountId,
    pub item_id: String,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub status: ReceiptStatus,
    pub error: Option<String>,
}

impl WebhookReceipt {
    pub fn pending(event: &WebhookEvent) -> Self {
        Self {
            dedupe_key: event.dedupe_key(),
            topic: event.topic.clone(),
            account_id: event.account_id.clone(),
            item_id: event.item_id.clone(),
            occurred_at: event.occurred_at,
            received_at: Utc::now(),
            status: ReceiptStatus::Pending,
            error: None,
        }
    }

    /// Whether a redelivery of this change should be processed again.
    pub fn is_retryable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ReceiptStatus::Failed => true,
            ReceiptStatus::Pending => {
                now - self.received_at >= chrono::Duration::seconds(PENDING_RECEIPT_TIMEOUT_SECS)
            }
            ReceiptStatus::Done | ReceiptStatus::Skipped => false,
        }
    }
}

/// What `SyncService::handle_webhook` did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Same change was already processed.
    Duplicate,
    /// Topic refers to something that is not mirrored.
    Ignored,
    /// No stored token for the event's account.
    NoConnection,
    Upserted,
    Deleted,
}

impl WebhookOutcome {
    pub fn receipt_status(&self) -> ReceiptStatus {
        match self {
            WebhookOutcome::Upserted | WebhookOutcome::Deleted => ReceiptStatus::Done,
            WebhookOutcome::Duplicate | WebhookOutcome::Ignored | WebhookOutcome::NoConnection => {
                ReceiptStatus::Skipped
            }
        }
    }
}

/// A flattened entity as returned by a `CrmSource`, before it is bound to an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedEntity {
    pub kind: EntityKind,
    pub external_id: String,
    pub data: serde_json::Value,
    pub occurred_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl FetchedEntity {
    pub fn from_record<T: EntityRecord>(record: &T) -> Result<Self> {
        let data = serde_json::to_value(record)
            .map_err(|e| Error::backend(format!("serialize {}", T::KIND), e))?;
        Ok(Self {
            kind: T::KIND,
            external_id: record.external_id().to_string(),
            data,
            occurred_at: record.occurred_at(),
            remote_updated_at: record.remote_updated_at(),
        })
    }

    pub fn into_synced(self, account_id: AccountId) -> SyncedEntity {
        SyncedEntity {
            kind: self.kind,
            external_id: self.external_id,
            account_id,
            data: self.data,
            occurred_at: self.occurred_at,
            remote_updated_at: self.remote_updated_at,
            synced_at: Utc::now(),
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPage {
    pub entities: Vec<FetchedEntity>,
    /// `None` when there are no further pages.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub counts: std::collections::BTreeMap<EntityKind, usize>,
}

impl BackfillReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}
