//! Flattened CRM entity records.
//!
//! These are the local row shapes; the CRM client maps its GraphQL responses
//! into them. Money is stored in integer cents, timestamps in UTC.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::EntityKind;

/// A record type that can be mirrored into the entity table.
pub trait EntityRecord: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EntityKind;

    fn external_id(&self) -> &str;

    /// Primary timestamp used for range queries (KPIs, reporting).
    fn occurred_at(&self) -> Option<DateTime<Utc>>;

    fn remote_updated_at(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub external_id: String,
    pub name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub billing_address: Address,
    pub is_company: bool,
    pub is_lead: bool,
    pub is_archived: bool,
    pub balance_cents: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for ClientRecord {
    const KIND: EntityKind = EntityKind::Client;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn remote_updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub external_id: String,
    pub job_number: Option<i64>,
    pub title: Option<String>,
    pub status: String,
    pub client_external_id: Option<String>,
    pub property_address: Address,
    pub instructions: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub total_cents: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for JobRecord {
    const KIND: EntityKind = EntityKind::Job;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.start_at.or(self.created_at)
    }

    fn remote_updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub external_id: String,
    pub quote_number: Option<i64>,
    pub title: Option<String>,
    pub status: String,
    pub client_external_id: Option<String>,
    pub subtotal_cents: i64,
    pub total_cents: i64,
    pub deposit_cents: i64,
    pub message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord for QuoteRecord {
    const KIND: EntityKind = EntityKind::Quote;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn remote_updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub external_id: String,
    pub invoice_number: Option<String>,
    pub subject: Option<String>,
    pub status: String,
    pub client_external_id: Option<String>,
    pub job_external_ids: Vec<String>,
    pub issued_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub subtotal_cents: i64,
    pub total_cents: i64,
    pub balance_cents: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InvoiceRecord {
    pub fn is_paid(&self) -> bool {
        self.status.eq_ignore_ascii_case("paid") || (self.total_cents > 0 && self.balance_cents <= 0)
    }
}

impl EntityRecord for InvoiceRecord {
    const KIND: EntityKind = EntityKind::Invoice;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.issued_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .or(self.created_at)
    }

    fn remote_updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub external_id: String,
    pub title: Option<String>,
    pub status: String,
    pub job_external_id: Option<String>,
    pub client_external_id: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_user_ids: Vec<String>,
    pub assigned_user_names: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl VisitRecord {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some() || self.status.eq_ignore_ascii_case("completed")
    }
}

impl EntityRecord for VisitRecord {
    const KIND: EntityKind = EntityKind::Visit;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.start_at.or(self.created_at)
    }

    fn remote_updated_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimesheetRecord {
    pub external_id: String,
    pub user_external_id: Option<String>,
    pub user_name: Option<String>,
    pub job_external_id: Option<String>,
    pub visit_external_id: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub approved: bool,
    pub note: Option<String>,
}

impl EntityRecord for TimesheetRecord {
    const KIND: EntityKind = EntityKind::Timesheet;

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.start_at
    }

    fn remote_updated_at(&self) -> Option<DateTime<Utc>> {
        self.end_at.or(self.start_at)
    }
}

/// Converts a decimal currency amount from the CRM into integer cents.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, SyncedEntity};

    #[test]
    fn to_cents_rounds_float_noise() {
        assert_eq!(to_cents(12.35), 1235);
        assert_eq!(to_cents(0.1 + 0.2), 30);
        assert_eq!(to_cents(-4.5), -450);
    }

    #[test]
    fn invoice_occurred_at_prefers_issue_date() {
        let inv = InvoiceRecord {
            external_id: "inv-1".into(),
            issued_date: NaiveDate::from_ymd_opt(2024, 3, 9),
            created_at: Some(Utc::now()),
            ..Default::default()
        };
        let at = inv.occurred_at().unwrap();
        assert_eq!(at.date_naive(), NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
    }

    #[test]
    fn synced_entity_decodes_back_into_its_kind_only() {
        let visit = VisitRecord {
            external_id: "v-1".into(),
            status: "COMPLETED".into(),
            ..Default::default()
        };
        let row = SyncedEntity::from_record(AccountId("acc".into()), &visit).unwrap();
        assert_eq!(row.kind, EntityKind::Visit);
        let back: VisitRecord = row.decode().unwrap();
        assert!(back.is_completed());
        assert!(row.decode::<JobRecord>().is_err());
    }
}
