//! Team performance figures derived from synced timesheets, visits and invoices.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{EntityRecord, InvoiceRecord, TimesheetRecord, VisitRecord};
use crate::models::SyncedEntity;
use crate::store::Store;
use crate::{Error, Result};

/// Longest window a single KPI query may cover.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl KpiRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from >= to {
            return Err(Error::InvalidInput("`from` must be before `to`".to_string()));
        }
        if to - from > Duration::days(MAX_RANGE_DAYS) {
            return Err(Error::InvalidInput(format!(
                "range must not exceed {MAX_RANGE_DAYS} days"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberKpis {
    /// CRM user id of the team member.
    pub member_id: String,
    pub name: Option<String>,
    pub hours_worked: f64,
    pub visits_assigned: u32,
    pub visits_completed: u32,
    /// `None` when nothing was assigned.
    pub completion_rate: Option<f64>,
    pub jobs_touched: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamKpis {
    pub range: KpiRange,
    pub members: Vec<MemberKpis>,
    pub total_hours: f64,
    pub visits_scheduled: u32,
    pub visits_completed: u32,
    pub invoiced_cents: i64,
    pub collected_cents: i64,
    pub outstanding_cents: i64,
}

#[derive(Default)]
struct Acc {
    name: Option<String>,
    seconds: i64,
    assigned: u32,
    completed: u32,
    jobs: BTreeSet<String>,
}

/// Aggregates the given records over `range`.
///
/// Records outside the range are ignored. A visit with several assignees
/// counts in full for each of them; team totals count it once.
pub fn compute_team_kpis(
    timesheets: &[TimesheetRecord],
    visits: &[VisitRecord],
    invoices: &[InvoiceRecord],
    range: KpiRange,
) -> TeamKpis {
    let mut members: BTreeMap<String, Acc> = BTreeMap::new();
    let mut total_seconds = 0i64;

    for ts in timesheets {
        if !ts.occurred_at().is_some_and(|at| range.contains(at)) {
            continue;
        }
        let seconds = timesheet_seconds(ts);
        total_seconds += seconds;

        let Some(member_id) = ts.user_external_id.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let acc = members.entry(member_id.to_string()).or_default();
        acc.seconds += seconds;
        if acc.name.is_none() {
            acc.name = ts.user_name.clone();
        }
        if let Some(job) = &ts.job_external_id {
            acc.jobs.insert(job.clone());
        }
    }

    let mut visits_scheduled = 0u32;
    let mut visits_completed = 0u32;
    for visit in visits {
        if !visit.occurred_at().is_some_and(|at| range.contains(at)) {
            continue;
        }
        visits_scheduled += 1;
        let completed = visit.is_completed();
        if completed {
            visits_completed += 1;
        }

        for (i, member_id) in visit.assigned_user_ids.iter().enumerate() {
            let acc = members.entry(member_id.clone()).or_default();
            acc.assigned += 1;
            if completed {
                acc.completed += 1;
            }
            if acc.name.is_none() {
                acc.name = visit.assigned_user_names.get(i).cloned();
            }
            if let Some(job) = &visit.job_external_id {
                acc.jobs.insert(job.clone());
            }
        }
    }

    let mut invoiced_cents = 0i64;
    let mut outstanding_cents = 0i64;
    for inv in invoices {
        if !inv.occurred_at().is_some_and(|at| range.contains(at)) {
            continue;
        }
        if inv.status.eq_ignore_ascii_case("draft") || inv.status.eq_ignore_ascii_case("bad_debt") {
            continue;
        }
        invoiced_cents += inv.total_cents;
        outstanding_cents += inv.balance_cents.max(0);
    }

    let mut members: Vec<MemberKpis> = members
        .into_iter()
        .map(|(member_id, acc)| MemberKpis {
            member_id,
            name: acc.name,
            hours_worked: hours(acc.seconds),
            visits_assigned: acc.assigned,
            visits_completed: acc.completed,
            completion_rate: (acc.assigned > 0)
                .then(|| round2(acc.completed as f64 / acc.assigned as f64)),
            jobs_touched: acc.jobs.len(),
        })
        .collect();
    members.sort_by(|a, b| {
        b.hours_worked
            .total_cmp(&a.hours_worked)
            .then_with(|| a.member_id.cmp(&b.member_id))
    });

    TeamKpis {
        range,
        members,
        total_hours: hours(total_seconds),
        visits_scheduled,
        visits_completed,
        invoiced_cents,
        collected_cents: invoiced_cents - outstanding_cents,
        outstanding_cents,
    }
}

fn timesheet_seconds(ts: &TimesheetRecord) -> i64 {
    if ts.duration_seconds > 0 {
        return ts.duration_seconds;
    }
    match (ts.start_at, ts.end_at) {
        (Some(start), Some(end)) if end > start => (end - start).num_seconds(),
        _ => 0,
    }
}

fn hours(seconds: i64) -> f64 {
    round2(seconds as f64 / 3600.0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Loads the records a KPI report needs from the store.
#[derive(Clone)]
pub struct KpiService {
    store: Arc<dyn Store>,
}

impl KpiService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn team_kpis(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<TeamKpis> {
        let range = KpiRange::new(from, to)?;
        let timesheets: Vec<TimesheetRecord> = self.load(range).await?;
        let visits: Vec<VisitRecord> = self.load(range).await?;
        let invoices: Vec<InvoiceRecord> = self.load(range).await?;
        Ok(compute_team_kpis(&timesheets, &visits, &invoices, range))
    }

    async fn load<T: EntityRecord>(&self, range: KpiRange) -> Result<Vec<T>> {
        let rows = self
            .store
            .list_entities_between(T::KIND, range.from, range.to)
            .await?;
        Ok(rows.iter().filter_map(decode_or_warn).collect())
    }
}

fn decode_or_warn<T: EntityRecord>(entity: &SyncedEntity) -> Option<T> {
    match entity.decode::<T>() {
        Ok(r) => Some(r),
        Err(e) => {
            tracing::warn!(kind = %entity.kind, external_id = %entity.external_id, error = %e, "skipping undecodable entity");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountId;
    use crate::store::SqliteStore;
    use chrono::{NaiveDate, TimeZone};

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap()
    }

    fn may() -> KpiRange {
        KpiRange::new(at(1, 0), Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()).unwrap()
    }

    fn timesheet(id: &str, user: &str, job: &str, start: DateTime<Utc>, hours: i64) -> TimesheetRecord {
        TimesheetRecord {
            external_id: id.into(),
            user_external_id: Some(user.into()),
            user_name: Some(format!("Cleaner {user}")),
            job_external_id: Some(job.into()),
            start_at: Some(start),
            end_at: Some(start + Duration::hours(hours)),
            ..Default::default()
        }
    }

    fn visit(id: &str, assignees: &[&str], job: &str, start: DateTime<Utc>, done: bool) -> VisitRecord {
        VisitRecord {
            external_id: id.into(),
            status: if done { "completed" } else { "upcoming" }.into(),
            job_external_id: Some(job.into()),
            start_at: Some(start),
            completed_at: done.then_some(start + Duration::hours(2)),
            assigned_user_ids: assignees.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn range_must_be_ordered_and_bounded() {
        assert!(KpiRange::new(at(2, 0), at(1, 0)).is_err());
        assert!(KpiRange::new(at(1, 0), at(1, 0)).is_err());
        assert!(KpiRange::new(at(1, 0), at(1, 0) + Duration::days(400)).is_err());
    }

    #[test]
    fn aggregates_hours_visits_and_revenue() {
        let timesheets = vec![
            timesheet("t1", "u1", "j1", at(2, 8), 3),
            timesheet("t2", "u1", "j2", at(3, 8), 2),
            timesheet("t3", "u2", "j1", at(2, 8), 4),
            // outside the range
            timesheet("t4", "u2", "j3", Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap(), 8),
        ];
        let visits = vec![
            visit("v1", &["u1", "u2"], "j1", at(2, 8), true),
            visit("v2", &["u1"], "j2", at(3, 8), false),
        ];
        let invoices = vec![
            InvoiceRecord {
                external_id: "i1".into(),
                status: "paid".into(),
                issued_date: NaiveDate::from_ymd_opt(2024, 5, 4),
                total_cents: 20_000,
                balance_cents: 0,
                ..Default::default()
            },
            InvoiceRecord {
                external_id: "i2".into(),
                status: "awaiting_payment".into(),
                issued_date: NaiveDate::from_ymd_opt(2024, 5, 10),
                total_cents: 15_000,
                balance_cents: 5_000,
                ..Default::default()
            },
            InvoiceRecord {
                external_id: "i3".into(),
                status: "draft".into(),
                issued_date: NaiveDate::from_ymd_opt(2024, 5, 11),
                total_cents: 9_999,
                balance_cents: 9_999,
                ..Default::default()
            },
        ];

        let k = compute_team_kpis(&timesheets, &visits, &invoices, may());
        assert_eq!(k.total_hours, 9.0);
        assert_eq!(k.visits_scheduled, 2);
        assert_eq!(k.visits_completed, 1);
        assert_eq!(k.invoiced_cents, 35_000);
        assert_eq!(k.outstanding_cents, 5_000);
        assert_eq!(k.collected_cents, 30_000);

        assert_eq!(k.members.len(), 2);
        let u1 = &k.members[0];
        let u2 = &k.members[1];
        assert_eq!(u1.member_id, "u1");
        assert_eq!(u1.hours_worked, 5.0);
        assert_eq!(u1.visits_assigned, 2);
        assert_eq!(u1.visits_completed, 1);
        assert_eq!(u1.completion_rate, Some(0.5));
        assert_eq!(u1.jobs_touched, 2);
        assert_eq!(u2.hours_worked, 4.0);
        assert_eq!(u2.completion_rate, Some(1.0));
    }

    #[test]
    fn empty_inputs_yield_zeroes() {
        let k = compute_team_kpis(&[], &[], &[], may());
        assert!(k.members.is_empty());
        assert_eq!(k.total_hours, 0.0);
        assert_eq!(k.collected_cents, 0);
    }

    #[tokio::test]
    async fn service_reads_synced_entities() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("k.db")).await.unwrap());
        let acc = AccountId("acc".into());
        store
            .upsert_entity(
                &SyncedEntity::from_record(acc.clone(), &timesheet("t1", "u1", "j1", at(2, 8), 3))
                    .unwrap(),
            )
            .await
            .unwrap();
        store
            .upsert_entity(
                &SyncedEntity::from_record(acc, &visit("v1", &["u1"], "j1", at(2, 8), true))
                    .unwrap(),
            )
            .await
            .unwrap();

        let svc = KpiService::new(store);
        let k = svc.team_kpis(may().from, may().to).await.unwrap();
        assert_eq!(k.total_hours, 3.0);
        assert_eq!(k.members[0].visits_completed, 1);

        assert!(matches!(
            svc.team_kpis(may().to, may().from).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
