//! Exception scanning.
//!
//! Rules are pure functions over entries and timesheets that emit
//! [`Finding`]s. Storage turns findings into [`Exception`] records, keyed by
//! [`Finding::fingerprint`] so a repeated scan never raises the same anomaly
//! twice and a reviewed exception is never resurrected.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::TimeEntry;
use crate::error::{Error, Result, ValidationError};
use crate::money::minutes_to_hours;
use crate::policy::{Catalog, WorkspacePolicy};
use crate::timer::ClampReason;
use crate::timesheet::{Timesheet, select_entries};
use crate::types::{
    ExceptionId, ExceptionKind, ExceptionStatus, ProjectId, Severity, TaskId, TimeEntryId,
    TimesheetId, UserId, WorkspaceId,
};

/// What an exception is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    TimeEntry(TimeEntryId),
    Timesheet(TimesheetId),
}

impl Subject {
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::TimeEntry(_) => "time_entry",
            Self::Timesheet(_) => "timesheet",
        }
    }

    #[must_use]
    pub fn id_str(&self) -> &str {
        match self {
            Self::TimeEntry(id) => id.as_str(),
            Self::Timesheet(id) => id.as_str(),
        }
    }

    /// Rebuilds a subject from its stored columns.
    pub fn parse(kind: &str, id: &str) -> Result<Self, ValidationError> {
        match kind {
            "time_entry" => Ok(Self::TimeEntry(TimeEntryId::new(id)?)),
            "timesheet" => Ok(Self::Timesheet(TimesheetId::new(id)?)),
            _ => Err(ValidationError::UnknownVariant {
                field: "exception subject",
                value: kind.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id_str())
    }
}

/// An anomaly detected by a rule, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: ExceptionKind,
    pub severity: Severity,
    pub subject: Subject,
    /// Entries involved besides, or including, the subject.
    pub related: Vec<TimeEntryId>,
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub date: Option<NaiveDate>,
    pub message: String,
}

impl Finding {
    /// Identity of the anomaly across scans.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let related: Vec<&str> = self.related.iter().map(TimeEntryId::as_str).collect();
        format!(
            "{}|{}|{}|{}",
            self.kind,
            self.subject,
            self.date.map_or_else(String::new, |d| d.to_string()),
            related.join(",")
        )
    }

    pub(crate) fn clamped_duration(entry: &TimeEntry, reason: ClampReason) -> Self {
        let message = match reason {
            ClampReason::NegativeDuration { raw_minutes } => format!(
                "timer produced a negative duration of {raw_minutes} minutes; clamped to 0"
            ),
            ClampReason::ExceedsMaximum {
                raw_minutes,
                max_minutes,
            } => format!(
                "timer ran {raw_minutes} minutes; clamped to the {max_minutes} minute maximum"
            ),
        };
        Self {
            kind: ExceptionKind::PolicyViolation,
            severity: Severity::High,
            subject: Subject::TimeEntry(entry.id.clone()),
            related: Vec::new(),
            user: entry.user.clone(),
            workspace: entry.workspace.clone(),
            date: Some(entry.started_at.date_naive()),
            message,
        }
    }

    /// A timer entry that landed in an already approved or locked period.
    pub fn frozen_period(entry: &TimeEntry, timesheet: &Timesheet) -> Self {
        Self {
            kind: ExceptionKind::PolicyViolation,
            severity: Severity::High,
            subject: Subject::TimeEntry(entry.id.clone()),
            related: Vec::new(),
            user: entry.user.clone(),
            workspace: entry.workspace.clone(),
            date: Some(entry.started_at.date_naive()),
            message: format!(
                "entry falls in {} timesheet {} for {}",
                timesheet.status, timesheet.id, timesheet.period
            ),
        }
    }

    /// One finding per unordered pair, whichever entry is seen first.
    pub fn duplicate(a: &TimeEntry, b: &TimeEntry) -> Self {
        let (first, second) = if a.id <= b.id { (a, b) } else { (b, a) };
        let identical = first.started_at == second.started_at && first.ended_at == second.ended_at;
        Self {
            kind: ExceptionKind::DuplicateEntry,
            severity: if identical {
                Severity::High
            } else {
                Severity::Medium
            },
            subject: Subject::TimeEntry(first.id.clone()),
            related: vec![first.id.clone(), second.id.clone()],
            user: first.user.clone(),
            workspace: first.workspace.clone(),
            date: Some(first.started_at.date_naive()),
            message: if identical {
                format!("entries {} and {} record the same interval", first.id, second.id)
            } else {
                format!("entries {} and {} overlap", first.id, second.id)
            },
        }
    }
}

/// Severity of hours beyond a threshold.
#[must_use]
pub fn overtime_severity(excess_hours: Decimal) -> Severity {
    if excess_hours <= Decimal::ONE {
        Severity::Low
    } else if excess_hours <= Decimal::from(4) {
        Severity::Medium
    } else if excess_hours <= Decimal::from(8) {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// Severity of a rate deviating from its canonical value.
#[must_use]
pub fn rate_severity(rate: Decimal, canonical: Decimal) -> Severity {
    if canonical.is_zero() {
        return Severity::Critical;
    }
    let deviation = ((rate - canonical) / canonical).abs();
    if deviation <= Decimal::new(10, 2) {
        Severity::Low
    } else if deviation <= Decimal::new(25, 2) {
        Severity::Medium
    } else if deviation <= Decimal::new(50, 2) {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// A persisted finding under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub id: ExceptionId,
    pub kind: ExceptionKind,
    pub severity: Severity,
    pub subject: Subject,
    pub related: Vec<TimeEntryId>,
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub date: Option<NaiveDate>,
    pub message: String,
    pub fingerprint: String,
    pub status: ExceptionStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl Exception {
    pub fn from_finding(finding: Finding, now: DateTime<Utc>) -> Self {
        let fingerprint = finding.fingerprint();
        Self {
            id: ExceptionId::generate(),
            kind: finding.kind,
            severity: finding.severity,
            subject: finding.subject,
            related: finding.related,
            user: finding.user,
            workspace: finding.workspace,
            date: finding.date,
            message: finding.message,
            fingerprint,
            status: ExceptionStatus::Open,
            created_at: now,
            reviewed_by: None,
            reviewed_at: None,
            note: None,
        }
    }

    pub fn resolve(&mut self, reviewer: UserId, note: &str, now: DateTime<Utc>) -> Result<()> {
        self.review(ExceptionStatus::Resolved, "resolve", reviewer, note, now)
    }

    pub fn dismiss(&mut self, reviewer: UserId, note: &str, now: DateTime<Utc>) -> Result<()> {
        self.review(ExceptionStatus::Dismissed, "dismiss", reviewer, note, now)
    }

    fn review(
        &mut self,
        status: ExceptionStatus,
        action: &'static str,
        reviewer: UserId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != ExceptionStatus::Open {
            return Err(Error::invalid_transition("exception", action, self.status));
        }
        let note = note.trim();
        if note.is_empty() {
            return Err(ValidationError::NoteRequired { action }.into());
        }
        self.status = status;
        self.reviewed_by = Some(reviewer);
        self.reviewed_at = Some(now);
        self.note = Some(note.to_string());
        Ok(())
    }
}

/// Runs the entry rules: daily overtime, overlapping intervals, rate mismatch.
pub fn scan_entries(
    entries: &[TimeEntry],
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    findings.extend(daily_overtime(entries, policy));
    findings.extend(overlapping_entries(entries));
    findings.extend(rate_mismatches(entries, policy, catalog));
    findings.sort_by_key(Finding::fingerprint);
    findings
}

fn daily_overtime(entries: &[TimeEntry], policy: &WorkspacePolicy) -> Vec<Finding> {
    let mut days: BTreeMap<(&UserId, NaiveDate), Vec<&TimeEntry>> = BTreeMap::new();
    for entry in entries {
        days.entry((&entry.user, entry.started_at.date_naive()))
            .or_default()
            .push(entry);
    }

    days.into_iter()
        .filter_map(|((user, date), mut members)| {
            let hours = minutes_to_hours(members.iter().map(|e| e.duration_minutes).sum());
            let excess = hours - policy.daily_overtime_hours;
            if excess <= Decimal::ZERO {
                return None;
            }
            members.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
            let first = members.first()?;
            Some(Finding {
                kind: ExceptionKind::Overtime,
                severity: overtime_severity(excess),
                subject: Subject::TimeEntry(first.id.clone()),
                related: Vec::new(),
                user: user.clone(),
                workspace: first.workspace.clone(),
                date: Some(date),
                message: format!(
                    "{hours} hours recorded on {date}, {excess} over the daily limit of {}",
                    policy.daily_overtime_hours
                ),
            })
        })
        .collect()
}

fn overlapping_entries(entries: &[TimeEntry]) -> Vec<Finding> {
    type WorkKey<'a> = (&'a UserId, Option<&'a ProjectId>, Option<&'a TaskId>);
    let mut groups: BTreeMap<WorkKey<'_>, Vec<&TimeEntry>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((&entry.user, entry.project.as_ref(), entry.task.as_ref()))
            .or_default()
            .push(entry);
    }

    let mut findings = Vec::new();
    for mut members in groups.into_values() {
        members.sort_by(|a, b| (a.started_at, &a.id).cmp(&(b.started_at, &b.id)));
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                // Sorted by start: nothing later can overlap `a` either.
                if b.started_at >= a.ended_at {
                    break;
                }
                if a.overlaps(b) {
                    findings.push(Finding::duplicate(a, b));
                }
            }
        }
    }
    findings
}

fn rate_mismatches(
    entries: &[TimeEntry],
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
) -> Vec<Finding> {
    entries
        .iter()
        .filter_map(|entry| {
            let rate = entry.hourly_rate?;
            let canonical = catalog.canonical_rate(entry.project.as_ref(), entry.task.as_ref())?;
            if (rate - canonical).abs() <= policy.rate_tolerance {
                return None;
            }
            Some(Finding {
                kind: ExceptionKind::RateMismatch,
                severity: rate_severity(rate, canonical),
                subject: Subject::TimeEntry(entry.id.clone()),
                related: Vec::new(),
                user: entry.user.clone(),
                workspace: entry.workspace.clone(),
                date: Some(entry.started_at.date_naive()),
                message: format!("entry rate {rate} differs from canonical rate {canonical}"),
            })
        })
        .collect()
}

/// Runs every rule over a timesheet and its entries.
///
/// Missing-time only considers expected work days up to `as_of`, so an open
/// period is not flagged for days that have not happened yet.
pub fn scan_timesheet(
    timesheet: &Timesheet,
    entries: &[TimeEntry],
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
    as_of: NaiveDate,
) -> Vec<Finding> {
    let selected: Vec<TimeEntry> = select_entries(timesheet, entries)
        .into_iter()
        .cloned()
        .collect();
    let mut findings = scan_entries(&selected, policy, catalog);

    if timesheet.overtime_hours > Decimal::ZERO {
        findings.push(Finding {
            kind: ExceptionKind::Overtime,
            severity: overtime_severity(timesheet.overtime_hours),
            subject: Subject::Timesheet(timesheet.id.clone()),
            related: Vec::new(),
            user: timesheet.user.clone(),
            workspace: timesheet.workspace.clone(),
            date: None,
            message: format!(
                "{} hours in {}, {} over the threshold of {}",
                timesheet.total_hours,
                timesheet.period,
                timesheet.overtime_hours,
                policy.weekly_overtime_hours
            ),
        });
    }

    let missing: Vec<NaiveDate> = timesheet
        .period
        .days()
        .filter(|day| *day <= as_of && policy.calendar.is_work_day(*day))
        .filter(|day| {
            !selected
                .iter()
                .any(|e| e.started_at.date_naive() == *day && e.duration_minutes > 0)
        })
        .collect();
    let severity = if missing.len() >= 3 {
        Severity::High
    } else {
        Severity::Medium
    };
    findings.extend(missing.into_iter().map(|day| Finding {
        kind: ExceptionKind::MissingTime,
        severity,
        subject: Subject::Timesheet(timesheet.id.clone()),
        related: Vec::new(),
        user: timesheet.user.clone(),
        workspace: timesheet.workspace.clone(),
        date: Some(day),
        message: format!("no time recorded on {day}"),
    }));

    findings.sort_by_key(Finding::fingerprint);
    debug!(timesheet = %timesheet.id, findings = findings.len(), "scanned timesheet");
    findings
}

/// Runs the entry rules for every user of a workspace in parallel.
pub fn scan_workspace(
    entries: &[TimeEntry],
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
) -> Vec<Finding> {
    let mut by_user: BTreeMap<&UserId, Vec<TimeEntry>> = BTreeMap::new();
    for entry in entries {
        by_user.entry(&entry.user).or_default().push(entry.clone());
    }
    let users = by_user.len();

    let mut findings: Vec<Finding> = by_user
        .into_par_iter()
        .flat_map_iter(|(_, user_entries)| scan_entries(&user_entries, policy, catalog))
        .collect();
    findings.sort_by_key(Finding::fingerprint);
    debug!(users, findings = findings.len(), "scanned workspace");
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::StaticCatalog;
    use crate::timesheet::{Period, compute_totals, plan_aggregation};
    use crate::types::{EntryStatus, Provenance};
    use chrono::{Duration, TimeZone};

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    fn entry(user: &str, task: &str, start: DateTime<Utc>, minutes: i64) -> TimeEntry {
        TimeEntry {
            id: TimeEntryId::generate(),
            user: UserId::new(user).unwrap(),
            workspace: WorkspaceId::new("acme").unwrap(),
            project: Some(ProjectId::new("web").unwrap()),
            task: Some(TaskId::new(task).unwrap()),
            description: None,
            started_at: start,
            ended_at: start + Duration::minutes(minutes),
            duration_minutes: minutes,
            billable: true,
            hourly_rate: None,
            cost: Decimal::ZERO,
            status: EntryStatus::Draft,
            provenance: Provenance::Manual,
            tags: Vec::new(),
            timer: None,
            created_at: start,
            updated_at: start,
            version: 0,
        }
    }

    fn no_catalog() -> StaticCatalog {
        StaticCatalog::default()
    }

    #[test]
    fn overlapping_pair_yields_one_duplicate() {
        let a = entry("alice", "login", at(3, 9, 0), 60);
        let b = entry("alice", "login", at(3, 9, 30), 60);
        let findings = scan_entries(&[a.clone(), b.clone()], &WorkspacePolicy::default(), &no_catalog());
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.kind, ExceptionKind::DuplicateEntry);
        assert_eq!(finding.severity, Severity::Medium);
        assert!(finding.related.contains(&a.id));
        assert!(finding.related.contains(&b.id));
    }

    #[test]
    fn adjacent_and_other_task_entries_do_not_overlap() {
        let entries = vec![
            entry("alice", "login", at(3, 9, 0), 60),
            entry("alice", "login", at(3, 10, 0), 60),
            entry("alice", "signup", at(3, 9, 30), 60),
            entry("bob", "login", at(3, 9, 30), 60),
        ];
        assert!(scan_entries(&entries, &WorkspacePolicy::default(), &no_catalog()).is_empty());
    }

    #[test]
    fn duplicate_fingerprint_ignores_argument_order() {
        let a = entry("alice", "login", at(3, 9, 0), 60);
        let b = entry("alice", "login", at(3, 9, 0), 60);
        let forward = Finding::duplicate(&a, &b);
        let backward = Finding::duplicate(&b, &a);
        assert_eq!(forward.fingerprint(), backward.fingerprint());
        assert_eq!(forward.severity, Severity::High);
    }

    #[test]
    fn daily_overtime_severity_scales() {
        let entries = vec![
            entry("alice", "login", at(3, 8, 0), 300),
            entry("alice", "signup", at(3, 14, 0), 300),
        ];
        let findings = scan_entries(&entries, &WorkspacePolicy::default(), &no_catalog());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, ExceptionKind::Overtime);
        // 10h against 8h: two over.
        assert_eq!(findings[0].severity, Severity::Medium);
        assert_eq!(findings[0].subject, Subject::TimeEntry(entries[0].id.clone()));
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(overtime_severity(Decimal::ONE), Severity::Low);
        assert_eq!(overtime_severity(Decimal::new(401, 2)), Severity::High);
        assert_eq!(overtime_severity(Decimal::from(9)), Severity::Critical);
        assert_eq!(rate_severity(Decimal::from(110), Decimal::from(100)), Severity::Low);
        assert_eq!(rate_severity(Decimal::from(80), Decimal::from(100)), Severity::Medium);
        assert_eq!(rate_severity(Decimal::from(150), Decimal::from(100)), Severity::High);
        assert_eq!(rate_severity(Decimal::from(10), Decimal::from(100)), Severity::Critical);
    }

    #[test]
    fn rate_mismatch_respects_tolerance() {
        let catalog = StaticCatalog::default().with_project(
            ProjectId::new("web").unwrap(),
            WorkspaceId::new("acme").unwrap(),
            Some(Decimal::from(100)),
        );
        let mut priced = entry("alice", "login", at(3, 9, 0), 60);
        priced.hourly_rate = Some(Decimal::from(120));
        let mut exact = entry("alice", "login", at(4, 9, 0), 60);
        exact.hourly_rate = Some(Decimal::from(100));
        let unpriced = entry("alice", "login", at(5, 9, 0), 60);

        let entries = vec![priced.clone(), exact, unpriced];
        let findings = scan_entries(&entries, &WorkspacePolicy::default(), &catalog);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, ExceptionKind::RateMismatch);
        assert_eq!(findings[0].subject, Subject::TimeEntry(priced.id));
        assert_eq!(findings[0].severity, Severity::Medium);

        let lenient = WorkspacePolicy {
            rate_tolerance: Decimal::from(25),
            ..WorkspacePolicy::default()
        };
        assert!(scan_entries(&entries, &lenient, &catalog).is_empty());
    }

    #[test]
    fn timesheet_scan_flags_period_overtime_and_missing_days() {
        let mut ts = Timesheet::new(
            UserId::new("alice").unwrap(),
            WorkspaceId::new("acme").unwrap(),
            Period::new(
                NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
            )
            .unwrap(),
            at(10, 0, 0),
        );
        // Monday and Tuesday only, 8h each: Wed-Fri are missing.
        let entries = vec![
            entry("alice", "login", at(3, 9, 0), 480),
            entry("alice", "login", at(4, 9, 0), 480),
        ];
        let policy = WorkspacePolicy {
            weekly_overtime_hours: Decimal::from(15),
            ..WorkspacePolicy::default()
        };
        let buckets = plan_aggregation(&ts, &entries, 500);
        ts.apply_totals(&compute_totals(&buckets, &policy), at(10, 0, 0));

        let findings = scan_timesheet(
            &ts,
            &entries,
            &policy,
            &no_catalog(),
            NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
        );
        let missing: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.kind == ExceptionKind::MissingTime)
            .collect();
        assert_eq!(missing.len(), 3);
        assert!(missing.iter().all(|f| f.severity == Severity::High));
        let overtime: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.kind == ExceptionKind::Overtime)
            .collect();
        assert_eq!(overtime.len(), 1);
        assert_eq!(overtime[0].subject, Subject::Timesheet(ts.id.clone()));

        // As of Wednesday only one expected day is empty.
        let findings = scan_timesheet(
            &ts,
            &entries,
            &policy,
            &no_catalog(),
            NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(),
        );
        let missing: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.kind == ExceptionKind::MissingTime)
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].severity, Severity::Medium);
    }

    #[test]
    fn workspace_scan_is_per_user_and_sorted() {
        let entries = vec![
            entry("alice", "login", at(3, 9, 0), 60),
            entry("alice", "login", at(3, 9, 30), 60),
            entry("bob", "login", at(3, 9, 0), 60),
            entry("bob", "login", at(3, 9, 15), 60),
            entry("carol", "login", at(3, 9, 0), 60),
        ];
        let findings = scan_workspace(&entries, &WorkspacePolicy::default(), &no_catalog());
        assert_eq!(findings.len(), 2);
        let mut fingerprints: Vec<String> = findings.iter().map(Finding::fingerprint).collect();
        let sorted = {
            let mut copy = fingerprints.clone();
            copy.sort();
            copy
        };
        assert_eq!(fingerprints, sorted);
        fingerprints.dedup();
        assert_eq!(fingerprints.len(), 2);
    }

    #[test]
    fn review_requires_note_and_open_status() {
        let a = entry("alice", "login", at(3, 9, 0), 60);
        let b = entry("alice", "login", at(3, 9, 0), 60);
        let mut exception = Exception::from_finding(Finding::duplicate(&a, &b), at(3, 12, 0));
        let reviewer = UserId::new("manager").unwrap();
        assert_eq!(
            exception.resolve(reviewer.clone(), "  ", at(3, 13, 0)).unwrap_err(),
            Error::Validation(ValidationError::NoteRequired { action: "resolve" })
        );
        exception
            .dismiss(reviewer.clone(), "double import", at(3, 13, 0))
            .unwrap();
        assert_eq!(exception.status, ExceptionStatus::Dismissed);
        assert!(exception.resolve(reviewer, "again", at(3, 14, 0)).is_err());
    }

    #[test]
    fn subject_round_trips_through_columns() {
        let subject = Subject::Timesheet(TimesheetId::new("ts-1").unwrap());
        assert_eq!(
            Subject::parse(subject.kind_str(), subject.id_str()).unwrap(),
            subject
        );
        assert!(Subject::parse("project", "p").is_err());
    }
}
