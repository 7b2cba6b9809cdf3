//! Time entry recording and validation.
//!
//! Entries come from a stopped timer ([`record_from_timer`]) or from manual
//! and imported input ([`record_manual`]). Both paths compute duration and
//! cost here so the two never diverge.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result, ValidationError};
use crate::exception::Finding;
use crate::idle::IdlePeriod;
use crate::money::{cost_for, ensure_amount, minutes_to_hours};
use crate::policy::{Catalog, WorkspacePolicy, validate_references};
use crate::timer::Timer;
use crate::types::{
    EntryStatus, ProjectId, Provenance, TaskId, TimeEntryId, TimerId, UserId, WorkspaceId,
};

/// An authoritative record of time spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: TimeEntryId,
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub billable: bool,
    pub hourly_rate: Option<Decimal>,
    pub cost: Decimal,
    pub status: EntryStatus,
    pub provenance: Provenance,
    pub tags: Vec<String>,
    pub timer: Option<TimerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl TimeEntry {
    /// Duration in hours, two decimal places.
    #[must_use]
    pub fn hours(&self) -> Decimal {
        minutes_to_hours(self.duration_minutes)
    }

    /// Whether the `[start, end)` intervals of both entries intersect.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.started_at < other.ended_at && other.started_at < self.ended_at
    }

    /// Whether both entries track the same user, project and task.
    #[must_use]
    pub fn same_work(&self, other: &Self) -> bool {
        self.user == other.user && self.project == other.project && self.task == other.task
    }

    /// Fails once the entry's timesheet has been approved or locked.
    pub fn ensure_mutable(&self) -> Result<()> {
        match self.status {
            EntryStatus::Approved | EntryStatus::Locked => {
                Err(Error::invalid_transition("time entry", "modify", self.status))
            }
            EntryStatus::Draft | EntryStatus::Submitted | EntryStatus::Rejected => Ok(()),
        }
    }
}

/// Input of [`record_manual`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTimeEntry {
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub billable: bool,
    pub hourly_rate: Option<Decimal>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_provenance")]
    pub provenance: Provenance,
    /// Refuse exact duplicate intervals instead of flagging them.
    #[serde(default)]
    pub strict: bool,
}

const fn default_provenance() -> Provenance {
    Provenance::Manual
}

/// A partial update. Outer `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChanges {
    pub project: Option<Option<ProjectId>>,
    pub task: Option<Option<TaskId>>,
    pub description: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub billable: Option<bool>,
    pub hourly_rate: Option<Option<Decimal>>,
    pub tags: Option<Vec<String>>,
}

impl EntryChanges {
    #[must_use]
    pub const fn touches_interval(&self) -> bool {
        self.started_at.is_some() || self.ended_at.is_some()
    }
}

/// Checks `end > start` and `0 < minutes ≤ max_minutes`; returns the minutes.
pub fn validate_interval(
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    max_minutes: i64,
) -> Result<i64, ValidationError> {
    if ended_at <= started_at {
        return Err(ValidationError::IntervalNotIncreasing {
            start: started_at,
            end: ended_at,
        });
    }
    let minutes = (ended_at - started_at).num_minutes();
    if minutes <= 0 || minutes > max_minutes {
        return Err(ValidationError::DurationOutOfBounds {
            minutes,
            max: max_minutes,
        });
    }
    Ok(minutes)
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

/// Validates and costs a manual or imported entry.
pub fn record_manual(
    input: NewTimeEntry,
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
    now: DateTime<Utc>,
) -> Result<TimeEntry> {
    if input.provenance == Provenance::Timer {
        return Err(ValidationError::UnknownVariant {
            field: "manual entry provenance",
            value: input.provenance.to_string(),
        }
        .into());
    }
    validate_references(
        catalog,
        &input.workspace,
        input.project.as_ref(),
        input.task.as_ref(),
    )?;
    let duration_minutes =
        validate_interval(input.started_at, input.ended_at, policy.max_entry_minutes)?;
    if let Some(rate) = input.hourly_rate {
        ensure_amount("hourly rate", rate)?;
    }

    let entry = TimeEntry {
        id: TimeEntryId::generate(),
        user: input.user,
        workspace: input.workspace,
        project: input.project,
        task: input.task,
        description: normalize_description(input.description),
        started_at: input.started_at,
        ended_at: input.ended_at,
        duration_minutes,
        billable: input.billable,
        hourly_rate: input.hourly_rate,
        cost: cost_for(input.hourly_rate, duration_minutes)?,
        status: EntryStatus::Draft,
        provenance: input.provenance,
        tags: normalize_tags(input.tags),
        timer: None,
        created_at: now,
        updated_at: now,
        version: 0,
    };
    debug!(entry = %entry.id, minutes = duration_minutes, cost = %entry.cost, "recorded entry");
    Ok(entry)
}

/// Builds the entry of a stopped timer.
///
/// Clamped durations are accepted so a forgotten or skewed timer can always be
/// stopped; they come back as `policy_violation` findings instead.
pub fn record_from_timer(
    timer: &Timer,
    idle: &[IdlePeriod],
    policy: &WorkspacePolicy,
    now: DateTime<Utc>,
) -> Result<(TimeEntry, Vec<Finding>)> {
    let active = timer.active_time(idle, policy.max_entry_minutes)?;
    let Some(ended_at) = timer.ended_at else {
        return Err(Error::invalid_transition("timer", "record", timer.status));
    };

    let mut tags = Vec::new();
    if let Some(project) = &timer.project {
        tags.push(format!("project:{project}"));
    }
    if let Some(task) = &timer.task {
        tags.push(format!("task:{task}"));
    }

    let entry = TimeEntry {
        id: TimeEntryId::generate(),
        user: timer.user.clone(),
        workspace: timer.workspace.clone(),
        project: timer.project.clone(),
        task: timer.task.clone(),
        description: timer.description.clone(),
        started_at: timer.started_at,
        ended_at,
        duration_minutes: active.minutes,
        billable: timer.billable,
        hourly_rate: timer.hourly_rate,
        cost: cost_for(timer.hourly_rate, active.minutes)?,
        status: EntryStatus::Draft,
        provenance: Provenance::Timer,
        tags: normalize_tags(tags),
        timer: Some(timer.id.clone()),
        created_at: now,
        updated_at: now,
        version: 0,
    };

    let mut findings = Vec::new();
    if let Some(reason) = active.clamped {
        warn!(timer = %timer.id, ?reason, "timer duration clamped");
        findings.push(Finding::clamped_duration(&entry, reason));
    }
    debug!(
        entry = %entry.id,
        timer = %timer.id,
        minutes = active.minutes,
        idle_seconds = active.idle_seconds,
        "recorded entry from timer"
    );
    Ok((entry, findings))
}

/// Applies `changes`, re-validating and re-costing as needed.
pub fn apply_changes(
    entry: &mut TimeEntry,
    changes: EntryChanges,
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
    now: DateTime<Utc>,
) -> Result<()> {
    entry.ensure_mutable()?;
    let touches_interval = changes.touches_interval();

    if let Some(project) = changes.project {
        entry.project = project;
    }
    if let Some(task) = changes.task {
        entry.task = task;
    }
    validate_references(
        catalog,
        &entry.workspace,
        entry.project.as_ref(),
        entry.task.as_ref(),
    )?;
    if let Some(description) = changes.description {
        entry.description = normalize_description(description);
    }
    if let Some(started_at) = changes.started_at {
        entry.started_at = started_at;
    }
    if let Some(ended_at) = changes.ended_at {
        entry.ended_at = ended_at;
    }
    if touches_interval {
        entry.duration_minutes =
            validate_interval(entry.started_at, entry.ended_at, policy.max_entry_minutes)?;
    }
    if let Some(billable) = changes.billable {
        entry.billable = billable;
    }
    if let Some(rate) = changes.hourly_rate {
        if let Some(rate) = rate {
            ensure_amount("hourly rate", rate)?;
        }
        entry.hourly_rate = rate;
    }
    if let Some(tags) = changes.tags {
        entry.tags = normalize_tags(tags);
    }
    entry.cost = cost_for(entry.hourly_rate, entry.duration_minutes)?;
    entry.updated_at = now;
    Ok(())
}

/// An existing entry of the same user, project and task with the identical
/// interval, if any.
pub fn find_exact_duplicate<'a>(
    candidate: &TimeEntry,
    existing: &'a [TimeEntry],
) -> Option<&'a TimeEntry> {
    existing.iter().find(|other| {
        other.id != candidate.id
            && other.same_work(candidate)
            && other.started_at == candidate.started_at
            && other.ended_at == candidate.ended_at
    })
}
