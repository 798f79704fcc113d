//! CRM GraphQL node shapes and their flattening into local records.

use chrono::{DateTime, NaiveDate, Utc};
use fieldsync_core::entities::{
    Address, ClientRecord, EntityRecord, InvoiceRecord, JobRecord, QuoteRecord, TimesheetRecord,
    VisitRecord, to_cents,
};
use fieldsync_core::sync::FetchedEntity;
use fieldsync_core::{EntityKind, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

/// GraphQL sends `null` for requested fields that have no value.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Nodes<T> {
    #[serde(default, deserialize_with = "null_as_default")]
    nodes: Vec<T>,
}

impl<T> Default for Nodes<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlAddress {
    street: Option<String>,
    city: Option<String>,
    province: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

impl From<GqlAddress> for Address {
    fn from(a: GqlAddress) -> Self {
        Address {
            street: a.street,
            city: a.city,
            province: a.province,
            postal_code: a.postal_code,
            country: a.country,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GqlEmail {
    address: String,
    #[serde(default, deserialize_with = "null_as_default")]
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct GqlPhone {
    number: String,
    #[serde(default, deserialize_with = "null_as_default")]
    primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlClient {
    id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    name: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    company_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    is_company: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    is_lead: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    is_archived: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    balance: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    emails: Vec<GqlEmail>,
    #[serde(default, deserialize_with = "null_as_default")]
    phones: Vec<GqlPhone>,
    billing_address: Option<GqlAddress>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<GqlClient> for ClientRecord {
    fn from(c: GqlClient) -> Self {
        let email = pick_primary(c.emails.into_iter().map(|e| (e.address, e.primary)));
        let phone = pick_primary(c.phones.into_iter().map(|p| (p.number, p.primary)));
        ClientRecord {
            external_id: c.id,
            name: c.name.unwrap_or_default(),
            first_name: c.first_name,
            last_name: c.last_name,
            company_name: c.company_name,
            email,
            phone,
            billing_address: c.billing_address.map(Address::from).unwrap_or_default(),
            is_company: c.is_company,
            is_lead: c.is_lead,
            is_archived: c.is_archived,
            balance_cents: to_cents(c.balance),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GqlProperty {
    address: Option<GqlAddress>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlJob {
    id: String,
    job_number: Option<i64>,
    title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    job_status: String,
    client: Option<IdRef>,
    property: Option<GqlProperty>,
    instructions: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    total: f64,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<GqlJob> for JobRecord {
    fn from(j: GqlJob) -> Self {
        JobRecord {
            external_id: j.id,
            job_number: j.job_number,
            title: j.title,
            status: j.job_status.to_ascii_lowercase(),
            client_external_id: j.client.map(|c| c.id),
            property_address: j
                .property
                .and_then(|p| p.address)
                .map(Address::from)
                .unwrap_or_default(),
            instructions: j.instructions,
            start_at: j.start_at,
            end_at: j.end_at,
            total_cents: to_cents(j.total),
            created_at: j.created_at,
            updated_at: j.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlQuoteAmounts {
    #[serde(default, deserialize_with = "null_as_default")]
    subtotal: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    total: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    deposit_amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlQuote {
    id: String,
    quote_number: Option<i64>,
    title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    quote_status: String,
    client: Option<IdRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    amounts: GqlQuoteAmounts,
    message: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<GqlQuote> for QuoteRecord {
    fn from(q: GqlQuote) -> Self {
        QuoteRecord {
            external_id: q.id,
            quote_number: q.quote_number,
            title: q.title,
            status: q.quote_status.to_ascii_lowercase(),
            client_external_id: q.client.map(|c| c.id),
            subtotal_cents: to_cents(q.amounts.subtotal),
            total_cents: to_cents(q.amounts.total),
            deposit_cents: to_cents(q.amounts.deposit_amount.unwrap_or(0.0)),
            message: q.message,
            created_at: q.created_at,
            updated_at: q.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlInvoiceAmounts {
    #[serde(default, deserialize_with = "null_as_default")]
    subtotal: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    total: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    invoice_balance: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlInvoice {
    id: String,
    invoice_number: Option<String>,
    subject: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    invoice_status: String,
    client: Option<IdRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    jobs: Nodes<IdRef>,
    issued_date: Option<NaiveDate>,
    due_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "null_as_default")]
    amounts: GqlInvoiceAmounts,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<GqlInvoice> for InvoiceRecord {
    fn from(i: GqlInvoice) -> Self {
        InvoiceRecord {
            external_id: i.id,
            invoice_number: i.invoice_number,
            subject: i.subject,
            status: i.invoice_status.to_ascii_lowercase(),
            client_external_id: i.client.map(|c| c.id),
            job_external_ids: i.jobs.nodes.into_iter().map(|j| j.id).collect(),
            issued_date: i.issued_date,
            due_date: i.due_date,
            subtotal_cents: to_cents(i.amounts.subtotal),
            total_cents: to_cents(i.amounts.total),
            balance_cents: to_cents(i.amounts.invoice_balance),
            created_at: i.created_at,
            updated_at: i.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GqlName {
    full: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GqlUser {
    id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    name: GqlName,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlVisit {
    id: String,
    title: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    visit_status: String,
    job: Option<IdRef>,
    client: Option<IdRef>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    assigned_users: Nodes<GqlUser>,
    created_at: Option<DateTime<Utc>>,
}

impl From<GqlVisit> for VisitRecord {
    fn from(v: GqlVisit) -> Self {
        let (ids, names) = v
            .assigned_users
            .nodes
            .into_iter()
            .map(|u| (u.id, u.name.full.unwrap_or_default()))
            .unzip();
        VisitRecord {
            external_id: v.id,
            title: v.title,
            status: v.visit_status.to_ascii_lowercase(),
            job_external_id: v.job.map(|j| j.id),
            client_external_id: v.client.map(|c| c.id),
            start_at: v.start_at,
            end_at: v.end_at,
            completed_at: v.completed_at,
            assigned_user_ids: ids,
            assigned_user_names: names,
            created_at: v.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlTimesheet {
    id: String,
    user: Option<GqlUser>,
    job: Option<IdRef>,
    visit: Option<IdRef>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    /// Seconds.
    #[serde(default, deserialize_with = "null_as_default")]
    final_duration: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    approved: bool,
    note: Option<String>,
}

impl From<GqlTimesheet> for TimesheetRecord {
    fn from(t: GqlTimesheet) -> Self {
        let (user_external_id, user_name) = match t.user {
            Some(u) => (Some(u.id), u.name.full),
            None => (None, None),
        };
        TimesheetRecord {
            external_id: t.id,
            user_external_id,
            user_name,
            job_external_id: t.job.map(|j| j.id),
            visit_external_id: t.visit.map(|v| v.id),
            start_at: t.start_at,
            end_at: t.end_at,
            duration_seconds: t.final_duration.unwrap_or(0).max(0),
            approved: t.approved,
            note: t.note,
        }
    }
}

/// Primary entry wins; otherwise the first one.
fn pick_primary(items: impl Iterator<Item = (String, bool)>) -> Option<String> {
    let mut first = None;
    for (value, primary) in items {
        if primary {
            return Some(value);
        }
        first.get_or_insert(value);
    }
    first
}

fn flatten_as<G, R>(kind: EntityKind, node: serde_json::Value) -> Result<FetchedEntity>
where
    G: DeserializeOwned + Into<R>,
    R: EntityRecord,
{
    let gql: G = serde_json::from_value(node)
        .map_err(|e| Error::backend(format!("decode crm {kind}"), e))?;
    FetchedEntity::from_record(&gql.into())
}

/// Flattens one GraphQL node of `kind` into its local record shape.
pub fn flatten(kind: EntityKind, node: serde_json::Value) -> Result<FetchedEntity> {
    match kind {
        EntityKind::Client => flatten_as::<GqlClient, ClientRecord>(kind, node),
        EntityKind::Job => flatten_as::<GqlJob, JobRecord>(kind, node),
        EntityKind::Quote => flatten_as::<GqlQuote, QuoteRecord>(kind, node),
        EntityKind::Invoice => flatten_as::<GqlInvoice, InvoiceRecord>(kind, node),
        EntityKind::Visit => flatten_as::<GqlVisit, VisitRecord>(kind, node),
        EntityKind::Timesheet => flatten_as::<GqlTimesheet, TimesheetRecord>(kind, node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_flattening_picks_primary_contact_and_cents() {
        let node = json!({
            "id": "Z2lkOi8vQ2xpZW50LzE=",
            "name": "Acme Offices",
            "companyName": "Acme",
            "isCompany": true,
            "balance": 120.5,
            "emails": [
                {"address": "info@acme.test", "primary": false},
                {"address": "ap@acme.test", "primary": true}
            ],
            "phones": [{"number": "555-0100", "primary": false}],
            "billingAddress": {"street": "1 Main St", "city": "Springfield", "postalCode": "12345"},
            "createdAt": "2024-01-02T03:04:05Z",
            "updatedAt": null
        });
        let e = flatten(EntityKind::Client, node).unwrap();
        assert_eq!(e.kind, EntityKind::Client);
        assert_eq!(e.external_id, "Z2lkOi8vQ2xpZW50LzE=");
        assert_eq!(e.data["email"], "ap@acme.test");
        assert_eq!(e.data["phone"], "555-0100");
        assert_eq!(e.data["balance_cents"], 12050);
        assert_eq!(e.data["billing_address"]["postal_code"], "12345");
        assert!(e.occurred_at.is_some());
    }

    #[test]
    fn invoice_flattening_collects_jobs_and_balance() {
        let node = json!({
            "id": "inv-1",
            "invoiceNumber": "1042",
            "invoiceStatus": "AWAITING_PAYMENT",
            "client": {"id": "c-1"},
            "jobs": {"nodes": [{"id": "j-1"}, {"id": "j-2"}]},
            "issuedDate": "2024-05-04",
            "amounts": {"subtotal": 100.0, "total": 113.0, "invoiceBalance": 13.0}
        });
        let e = flatten(EntityKind::Invoice, node).unwrap();
        let inv: InvoiceRecord = serde_json::from_value(e.data).unwrap();
        assert_eq!(inv.status, "awaiting_payment");
        assert_eq!(inv.job_external_ids, vec!["j-1", "j-2"]);
        assert_eq!(inv.total_cents, 11_300);
        assert_eq!(inv.balance_cents, 1_300);
        assert!(!inv.is_paid());
    }

    #[test]
    fn visit_and_timesheet_flattening() {
        let visit = json!({
            "id": "v-1",
            "visitStatus": "COMPLETED",
            "job": {"id": "j-1"},
            "startAt": "2024-05-02T08:00:00Z",
            "completedAt": "2024-05-02T10:00:00Z",
            "assignedUsers": {"nodes": [
                {"id": "u-1", "name": {"full": "Dana"}},
                {"id": "u-2", "name": {"full": null}}
            ]}
        });
        let v: VisitRecord = serde_json::from_value(flatten(EntityKind::Visit, visit).unwrap().data).unwrap();
        assert!(v.is_completed());
        assert_eq!(v.assigned_user_ids, vec!["u-1", "u-2"]);
        assert_eq!(v.assigned_user_names, vec!["Dana", ""]);

        let ts = json!({
            "id": "t-1",
            "user": {"id": "u-1", "name": {"full": "Dana"}},
            "startAt": "2024-05-02T08:00:00Z",
            "endAt": "2024-05-02T11:00:00Z",
            "finalDuration": 10800,
            "approved": true
        });
        let t: TimesheetRecord = serde_json::from_value(flatten(EntityKind::Timesheet, ts).unwrap().data).unwrap();
        assert_eq!(t.duration_seconds, 10_800);
        assert_eq!(t.user_external_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn null_fields_fall_back_to_defaults() {
        let job = json!({"id": "j-1", "jobStatus": null, "total": null});
        let j: JobRecord = serde_json::from_value(flatten(EntityKind::Job, job).unwrap().data).unwrap();
        assert_eq!(j.total_cents, 0);
        assert_eq!(j.status, "");

        let invoice = json!({"id": "inv-1", "amounts": null, "jobs": null, "invoiceStatus": "PAID"});
        let inv: InvoiceRecord =
            serde_json::from_value(flatten(EntityKind::Invoice, invoice).unwrap().data).unwrap();
        assert!(inv.job_external_ids.is_empty());
        assert_eq!(inv.balance_cents, 0);

        let quote = json!({"id": "q-1", "amounts": {"subtotal": null, "total": 50.0, "depositAmount": null}});
        let q: QuoteRecord = serde_json::from_value(flatten(EntityKind::Quote, quote).unwrap().data).unwrap();
        assert_eq!(q.total_cents, 5_000);
        assert_eq!(q.deposit_cents, 0);

        let visit = json!({"id": "v-1", "visitStatus": null, "assignedUsers": {"nodes": null}});
        let v: VisitRecord = serde_json::from_value(flatten(EntityKind::Visit, visit).unwrap().data).unwrap();
        assert!(v.assigned_user_ids.is_empty());
        let visit = json!({"id": "v-2", "assignedUsers": null});
        assert!(flatten(EntityKind::Visit, visit).is_ok());

        let client = json!({"id": "c-1", "balance": null, "emails": null, "isLead": null});
        let c: ClientRecord = serde_json::from_value(flatten(EntityKind::Client, client).unwrap().data).unwrap();
        assert_eq!(c.balance_cents, 0);
        assert!(c.email.is_none());

        let ts = json!({"id": "t-1", "approved": null, "user": {"id": "u-1", "name": null}});
        let t: TimesheetRecord =
            serde_json::from_value(flatten(EntityKind::Timesheet, ts).unwrap().data).unwrap();
        assert!(!t.approved);
        assert!(t.user_name.is_none());
    }

    #[test]
    fn malformed_node_is_a_backend_error() {
        let err = flatten(EntityKind::Job, json!({"title": "no id"})).unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
    }
}
