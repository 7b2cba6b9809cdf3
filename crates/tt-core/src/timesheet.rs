//! Timesheet aggregation.
//!
//! Aggregation is split into a pure plan ([`plan_aggregation`]) and a merge
//! step performed by storage: planned buckets are upserted by their
//! deterministic id so manual overrides survive, and buckets no longer backed
//! by any entry are removed. Running the plan twice over the same entries
//! yields the same buckets and the same totals.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::entry::TimeEntry;
use crate::error::{Error, Result, ValidationError};
use crate::money::{ensure_amount, minutes_to_hours};
use crate::policy::WorkspacePolicy;
use crate::types::{
    ProjectId, TaskId, TimeEntryId, TimesheetEntryId, TimesheetId, TimesheetStatus, UserId,
    WorkspaceId,
};

/// An inclusive range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ValidationError> {
        if end < start {
            return Err(ValidationError::InvalidPeriod { start, end });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Whether the instant's UTC date falls inside the period.
    #[must_use]
    pub fn contains_instant(&self, instant: DateTime<Utc>) -> bool {
        self.contains(instant.date_naive())
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Midnight UTC of the first day.
    #[must_use]
    pub fn start_instant(&self) -> DateTime<Utc> {
        self.start.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// Midnight UTC after the last day.
    #[must_use]
    pub fn end_instant_exclusive(&self) -> DateTime<Utc> {
        self.end.and_time(chrono::NaiveTime::MIN).and_utc() + Duration::days(1)
    }

    /// Every day of the period, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(|day| *day <= self.end)
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// The periodic aggregate of a user's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timesheet {
    pub id: TimesheetId,
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub period: Period,
    pub status: TimesheetStatus,
    pub total_hours: Decimal,
    pub billable_hours: Decimal,
    pub overtime_hours: Decimal,
    pub total_cost: Decimal,
    /// Hours granted by the final approver, when they differ from the total.
    pub approved_hours: Option<Decimal>,
    /// Submission round; every submit opens a new one.
    pub round: i64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub submitted_by: Option<UserId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<UserId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<UserId>,
    /// Set when a linked entry changed after the last aggregation.
    pub needs_recompute: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Timesheet {
    pub fn new(user: UserId, workspace: WorkspaceId, period: Period, now: DateTime<Utc>) -> Self {
        Self {
            id: TimesheetId::generate(),
            user,
            workspace,
            period,
            status: TimesheetStatus::Draft,
            total_hours: Decimal::ZERO,
            billable_hours: Decimal::ZERO,
            overtime_hours: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            approved_hours: None,
            round: 0,
            submitted_at: None,
            submitted_by: None,
            approved_at: None,
            approved_by: None,
            locked_at: None,
            locked_by: None,
            needs_recompute: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Approved and locked timesheets are frozen.
    pub fn ensure_aggregatable(&self) -> Result<()> {
        if self.status.is_editable() {
            Ok(())
        } else {
            Err(Error::invalid_transition("timesheet", "aggregate", self.status))
        }
    }

    /// Stores freshly computed totals and clears the dirty flag.
    pub fn apply_totals(&mut self, totals: &Totals, now: DateTime<Utc>) {
        self.total_hours = totals.total_hours;
        self.billable_hours = totals.billable_hours;
        self.overtime_hours = totals.overtime_hours;
        self.total_cost = totals.total_cost;
        self.needs_recompute = false;
        if self.status == TimesheetStatus::ChangesRequested {
            self.status = TimesheetStatus::Draft;
        }
        self.updated_at = now;
    }
}

/// Grouping key of a timesheet bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub date: NaiveDate,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
}

impl BucketKey {
    fn of(entry: &TimeEntry) -> Self {
        Self {
            date: entry.started_at.date_naive(),
            project: entry.project.clone(),
            task: entry.task.clone(),
        }
    }
}

/// Deterministic id of a bucket: equal inputs always map to the same row.
pub fn bucket_id(timesheet: &TimesheetId, key: &BucketKey) -> TimesheetEntryId {
    let content = format!(
        "{timesheet}|{}|{}|{}",
        key.date,
        key.project.as_ref().map_or("", ProjectId::as_str),
        key.task.as_ref().map_or("", TaskId::as_str),
    );
    TimesheetEntryId::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes()))
}

/// One `(date, project, task)` bucket of a timesheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimesheetEntry {
    pub id: TimesheetEntryId,
    pub timesheet: TimesheetId,
    pub key: BucketKey,
    pub description: Option<String>,
    pub minutes: i64,
    pub billable_minutes: i64,
    pub cost: Decimal,
    pub override_hours: Option<Decimal>,
    pub override_rate: Option<Decimal>,
    pub notes: Option<String>,
    pub time_entries: Vec<TimeEntryId>,
}

impl TimesheetEntry {
    /// Sum of linked durations, in hours.
    #[must_use]
    pub fn hours(&self) -> Decimal {
        minutes_to_hours(self.minutes)
    }

    /// The override if present, else the linked hours.
    #[must_use]
    pub fn effective_hours(&self) -> Decimal {
        self.override_hours.unwrap_or_else(|| self.hours())
    }

    /// Effective hours scaled by the billable share of the linked minutes.
    #[must_use]
    pub fn effective_billable_hours(&self) -> Decimal {
        if self.billable_minutes == self.minutes {
            return self.effective_hours();
        }
        if self.minutes == 0 {
            return Decimal::ZERO;
        }
        (self.effective_hours() * Decimal::from(self.billable_minutes) / Decimal::from(self.minutes))
            .round_dp(2)
    }

    /// Linked cost, re-priced by the override rate and/or hours.
    #[must_use]
    pub fn effective_cost(&self) -> Decimal {
        match (self.override_rate, self.override_hours) {
            (Some(rate), _) => (rate * self.effective_hours()).round_dp(2),
            (None, Some(hours)) if self.minutes > 0 => {
                (self.cost * hours * Decimal::from(60) / Decimal::from(self.minutes)).round_dp(2)
            }
            (None, Some(_)) => Decimal::ZERO,
            (None, None) => self.cost,
        }
    }

    /// Sets or clears the manual adjustment.
    pub fn set_override(
        &mut self,
        hours: Option<Decimal>,
        rate: Option<Decimal>,
        notes: Option<String>,
    ) -> Result<()> {
        if let Some(hours) = hours {
            ensure_amount("override hours", hours)?;
        }
        if let Some(rate) = rate {
            ensure_amount("override rate", rate)?;
        }
        self.override_hours = hours.map(|h| h.round_dp(2));
        self.override_rate = rate;
        self.notes = notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        Ok(())
    }
}

/// Timesheet totals derived from its buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_hours: Decimal,
    pub billable_hours: Decimal,
    pub overtime_hours: Decimal,
    pub total_cost: Decimal,
}

pub fn compute_totals(buckets: &[TimesheetEntry], policy: &WorkspacePolicy) -> Totals {
    let total_hours: Decimal = buckets.iter().map(TimesheetEntry::effective_hours).sum();
    let billable_hours = buckets
        .iter()
        .map(TimesheetEntry::effective_billable_hours)
        .sum();
    let total_cost = buckets.iter().map(TimesheetEntry::effective_cost).sum();
    let overtime_hours = (total_hours - policy.weekly_overtime_hours).max(Decimal::ZERO);
    Totals {
        total_hours,
        billable_hours,
        overtime_hours,
        total_cost,
    }
}

/// Entries of the timesheet's owner and workspace that start inside its period.
pub fn select_entries<'a>(timesheet: &Timesheet, entries: &'a [TimeEntry]) -> Vec<&'a TimeEntry> {
    entries
        .iter()
        .filter(|e| {
            e.user == timesheet.user
                && e.workspace == timesheet.workspace
                && timesheet.period.contains_instant(e.started_at)
        })
        .collect()
}

/// Groups the timesheet's entries into fresh buckets without overrides.
///
/// Buckets come back ordered by key; entries inside a bucket by start time.
pub fn plan_aggregation(
    timesheet: &Timesheet,
    entries: &[TimeEntry],
    description_limit: usize,
) -> Vec<TimesheetEntry> {
    let mut groups: BTreeMap<BucketKey, Vec<&TimeEntry>> = BTreeMap::new();
    for entry in select_entries(timesheet, entries) {
        groups.entry(BucketKey::of(entry)).or_default().push(entry);
    }

    let buckets: Vec<TimesheetEntry> = groups
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
            let minutes = members.iter().map(|e| e.duration_minutes).sum();
            let billable_minutes = members
                .iter()
                .filter(|e| e.billable)
                .map(|e| e.duration_minutes)
                .sum();
            TimesheetEntry {
                id: bucket_id(&timesheet.id, &key),
                timesheet: timesheet.id.clone(),
                description: combine_descriptions(&members, description_limit),
                minutes,
                billable_minutes,
                cost: members.iter().map(|e| e.cost).sum(),
                override_hours: None,
                override_rate: None,
                notes: None,
                time_entries: members.iter().map(|e| e.id.clone()).collect(),
                key,
            }
        })
        .collect();

    debug!(
        timesheet = %timesheet.id,
        buckets = buckets.len(),
        "planned aggregation"
    );
    buckets
}

/// Distinct descriptions in entry order, joined and cut to `limit` characters.
fn combine_descriptions(members: &[&TimeEntry], limit: usize) -> Option<String> {
    let mut seen: Vec<&str> = Vec::new();
    for description in members.iter().filter_map(|e| e.description.as_deref()) {
        if !seen.contains(&description) {
            seen.push(description);
        }
    }
    if seen.is_empty() {
        return None;
    }
    let combined = seen.join("; ");
    if combined.chars().count() <= limit {
        return Some(combined);
    }
    let mut cut: String = combined.chars().take(limit.saturating_sub(3)).collect();
    cut.push_str("...");
    Some(cut)
}

/// Carries manual overrides from stored buckets onto freshly planned ones.
pub fn carry_overrides(planned: &mut [TimesheetEntry], stored: &[TimesheetEntry]) {
    for bucket in planned {
        if let Some(previous) = stored.iter().find(|s| s.id == bucket.id) {
            bucket.override_hours = previous.override_hours;
            bucket.override_rate = previous.override_rate;
            bucket.notes.clone_from(&previous.notes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryStatus, Provenance};
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn week() -> Period {
        Period::new(day(3), day(9)).unwrap()
    }

    fn sheet() -> Timesheet {
        Timesheet::new(
            UserId::new("alice").unwrap(),
            WorkspaceId::new("acme").unwrap(),
            week(),
            Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
        )
    }

    fn entry(d: u32, h: u32, minutes: i64, task: &str, billable: bool) -> TimeEntry {
        let start = Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap();
        TimeEntry {
            id: TimeEntryId::generate(),
            user: UserId::new("alice").unwrap(),
            workspace: WorkspaceId::new("acme").unwrap(),
            project: Some(ProjectId::new("web").unwrap()),
            task: Some(TaskId::new(task).unwrap()),
            description: Some(format!("work on {task}")),
            started_at: start,
            ended_at: start + Duration::minutes(minutes),
            duration_minutes: minutes,
            billable,
            hourly_rate: Some(Decimal::from(50)),
            cost: crate::money::cost_for(Some(Decimal::from(50)), minutes).unwrap(),
            status: EntryStatus::Draft,
            provenance: Provenance::Manual,
            tags: Vec::new(),
            timer: None,
            created_at: start,
            updated_at: start,
            version: 0,
        }
    }

    #[test]
    fn period_validation_and_membership() {
        assert!(Period::new(day(9), day(3)).is_err());
        let period = week();
        assert!(period.contains(day(3)));
        assert!(period.contains(day(9)));
        assert!(!period.contains(day(10)));
        assert_eq!(period.days().count(), 7);
        assert!(period.overlaps(&Period::new(day(9), day(15)).unwrap()));
        assert!(!period.overlaps(&Period::new(day(10), day(16)).unwrap()));
    }

    #[test]
    fn groups_by_date_project_task() {
        let entries = vec![
            entry(3, 9, 60, "a", true),
            entry(3, 11, 30, "a", false),
            entry(3, 13, 45, "b", true),
            entry(4, 9, 60, "a", true),
            // Outside the period.
            entry(10, 9, 60, "a", true),
        ];
        let buckets = plan_aggregation(&sheet(), &entries, 500);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].minutes, 90);
        assert_eq!(buckets[0].billable_minutes, 60);
        assert_eq!(buckets[0].time_entries.len(), 2);
        assert_eq!(buckets[0].description.as_deref(), Some("work on a"));
        assert_eq!(buckets[0].effective_billable_hours(), Decimal::ONE);
    }

    #[test]
    fn plan_is_deterministic() {
        let entries = vec![entry(3, 9, 60, "a", true), entry(5, 9, 30, "b", true)];
        let ts = sheet();
        let first = plan_aggregation(&ts, &entries, 500);
        let second = plan_aggregation(&ts, &entries, 500);
        assert_eq!(first, second);
        assert_eq!(
            first[0].id,
            bucket_id(&ts.id, &first[0].key),
        );
    }

    #[test]
    fn weekly_overtime_is_excess_over_threshold() {
        // 5 days × 8h + 4h = 44h.
        let mut entries: Vec<TimeEntry> = (3..=7).map(|d| entry(d, 8, 480, "a", true)).collect();
        entries.push(entry(8, 9, 240, "a", true));
        let buckets = plan_aggregation(&sheet(), &entries, 500);
        let totals = compute_totals(&buckets, &WorkspacePolicy::default());
        assert_eq!(totals.total_hours, Decimal::from(44));
        assert_eq!(totals.overtime_hours, Decimal::new(400, 2));
        assert_eq!(totals.billable_hours, Decimal::from(44));
        assert_eq!(totals.total_cost, Decimal::from(2200));
    }

    #[test]
    fn overrides_drive_effective_values() {
        let entries = vec![entry(3, 9, 120, "a", true)];
        let mut buckets = plan_aggregation(&sheet(), &entries, 500);
        buckets[0]
            .set_override(Some(Decimal::new(15, 1)), Some(Decimal::from(80)), Some("trimmed".into()))
            .unwrap();
        assert_eq!(buckets[0].effective_hours(), Decimal::new(150, 2));
        assert_eq!(buckets[0].effective_cost(), Decimal::from(120));
        let totals = compute_totals(&buckets, &WorkspacePolicy::default());
        assert_eq!(totals.total_hours, Decimal::new(15, 1));

        buckets[0].set_override(Some(Decimal::ONE), None, None).unwrap();
        // 100.00 over 2h re-priced to 1h.
        assert_eq!(buckets[0].effective_cost(), Decimal::from(50));
        assert!(buckets[0].set_override(Some(Decimal::from(-1)), None, None).is_err());
        assert!(buckets[0].set_override(None, Some(Decimal::MAX), None).is_err());
        assert!(buckets[0].set_override(Some(Decimal::MAX), None, None).is_err());
        assert_eq!(buckets[0].effective_cost(), Decimal::from(50));
    }

    #[test]
    fn overrides_survive_replanning() {
        let entries = vec![entry(3, 9, 120, "a", true)];
        let ts = sheet();
        let mut stored = plan_aggregation(&ts, &entries, 500);
        stored[0].set_override(Some(Decimal::ONE), None, None).unwrap();
        let mut planned = plan_aggregation(&ts, &entries, 500);
        carry_overrides(&mut planned, &stored);
        assert_eq!(planned[0].override_hours, Some(Decimal::ONE));
    }

    #[test]
    fn descriptions_are_deduplicated_and_truncated() {
        let mut a = entry(3, 9, 30, "a", true);
        let mut b = entry(3, 10, 30, "a", true);
        let c = entry(3, 11, 30, "a", true);
        a.description = Some("design review".into());
        b.description = Some("design review".into());
        let entries = vec![a, b, c];
        let buckets = plan_aggregation(&sheet(), &entries, 500);
        assert_eq!(
            buckets[0].description.as_deref(),
            Some("design review; work on a")
        );
        let buckets = plan_aggregation(&sheet(), &entries, 10);
        assert_eq!(buckets[0].description.as_deref(), Some("design ..."));
    }

    #[test]
    fn frozen_timesheets_refuse_aggregation() {
        let mut ts = sheet();
        ts.status = TimesheetStatus::Locked;
        assert_eq!(
            ts.ensure_aggregatable().unwrap_err(),
            Error::invalid_transition("timesheet", "aggregate", "locked")
        );
        ts.status = TimesheetStatus::ChangesRequested;
        assert!(ts.ensure_aggregatable().is_ok());
        ts.apply_totals(
            &compute_totals(&[], &WorkspacePolicy::default()),
            Utc.with_ymd_and_hms(2025, 3, 10, 1, 0, 0).unwrap(),
        );
        assert_eq!(ts.status, TimesheetStatus::Draft);
    }
}
