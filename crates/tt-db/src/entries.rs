//! Time entry storage.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info};
use tt_core::entry::{apply_changes, find_exact_duplicate, record_manual};
use tt_core::{
    EntryChanges, Finding, NewTimeEntry, TimeEntry, TimeEntryId, UserId, ValidationError,
    WorkspaceId,
};

use crate::codec::{
    format_opt_decimal, format_timestamp, json_list, opt_parsed, parsed, timestamp, to_json,
};
use crate::exceptions::raise_findings;
use crate::timesheets::{mark_dirty, timesheet_covering};
use crate::{Database, DbError, EntryOutcome, ensure_written, immediate};

/// Selects entries for listing and scanning. Unset fields match everything.
///
/// `from` is inclusive and `to` exclusive, both compared to the entry start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub user: Option<UserId>,
    pub workspace: Option<WorkspaceId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

const ENTRY_COLUMNS: &str = "
    id, user_id, workspace_id, project_id, task_id, description, started_at, ended_at,
    duration_minutes, billable, hourly_rate, cost, status, provenance, tags, timer_id,
    created_at, updated_at, version
";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<TimeEntry> {
    Ok(TimeEntry {
        id: parsed(row, 0)?,
        user: parsed(row, 1)?,
        workspace: parsed(row, 2)?,
        project: opt_parsed(row, 3)?,
        task: opt_parsed(row, 4)?,
        description: row.get(5)?,
        started_at: timestamp(row, 6)?,
        ended_at: timestamp(row, 7)?,
        duration_minutes: row.get(8)?,
        billable: row.get(9)?,
        hourly_rate: opt_parsed(row, 10)?,
        cost: parsed(row, 11)?,
        status: parsed(row, 12)?,
        provenance: parsed(row, 13)?,
        tags: json_list(row, 14)?,
        timer: opt_parsed(row, 15)?,
        created_at: timestamp(row, 16)?,
        updated_at: timestamp(row, 17)?,
        version: row.get(18)?,
    })
}

pub(crate) fn load_entry(conn: &Connection, id: &TimeEntryId) -> Result<TimeEntry, DbError> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM time_entries WHERE id = ?");
    conn.query_row(&sql, [id.as_str()], entry_from_row)
        .optional()?
        .ok_or_else(|| tt_core::Error::not_found("time entry", id).into())
}

pub(crate) fn query_entries(conn: &Connection, filter: &EntryFilter) -> Result<Vec<TimeEntry>, DbError> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(user) = &filter.user {
        clauses.push("user_id = ?");
        values.push(user.to_string());
    }
    if let Some(workspace) = &filter.workspace {
        clauses.push("workspace_id = ?");
        values.push(workspace.to_string());
    }
    if let Some(from) = filter.from {
        clauses.push("started_at >= ?");
        values.push(format_timestamp(from));
    }
    if let Some(to) = filter.to {
        clauses.push("started_at < ?");
        values.push(format_timestamp(to));
    }
    let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM time_entries");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY started_at ASC, id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), entry_from_row)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn insert_entry(conn: &Connection, entry: &TimeEntry) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO time_entries ({ENTRY_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            entry.id.as_str(),
            entry.user.as_str(),
            entry.workspace.as_str(),
            entry.project.as_ref().map(|p| p.as_str()),
            entry.task.as_ref().map(|t| t.as_str()),
            entry.description,
            format_timestamp(entry.started_at),
            format_timestamp(entry.ended_at),
            entry.duration_minutes,
            entry.billable,
            format_opt_decimal(entry.hourly_rate),
            entry.cost.to_string(),
            entry.status.as_str(),
            entry.provenance.as_str(),
            to_json(&entry.tags)?,
            entry.timer.as_ref().map(|t| t.as_str()),
            format_timestamp(entry.created_at),
            format_timestamp(entry.updated_at),
            entry.version,
        ],
    )?;
    Ok(())
}

fn update_entry(conn: &Connection, entry: &mut TimeEntry) -> Result<(), DbError> {
    let changed = conn.execute(
        "
        UPDATE time_entries SET
            project_id = ?, task_id = ?, description = ?, started_at = ?, ended_at = ?,
            duration_minutes = ?, billable = ?, hourly_rate = ?, cost = ?, tags = ?,
            updated_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        ",
        params![
            entry.project.as_ref().map(|p| p.as_str()),
            entry.task.as_ref().map(|t| t.as_str()),
            entry.description,
            format_timestamp(entry.started_at),
            format_timestamp(entry.ended_at),
            entry.duration_minutes,
            entry.billable,
            format_opt_decimal(entry.hourly_rate),
            entry.cost.to_string(),
            to_json(&entry.tags)?,
            format_timestamp(entry.updated_at),
            entry.id.as_str(),
            entry.version,
        ],
    )?;
    ensure_written(changed, "time entry", entry.id.as_str())?;
    entry.version += 1;
    Ok(())
}

/// Exact duplicates of `entry` already stored, as findings, or an error in
/// strict mode.
fn check_duplicate(conn: &Connection, entry: &TimeEntry, strict: bool) -> Result<Option<Finding>, DbError> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM time_entries WHERE user_id = ? AND started_at = ?");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![entry.user.as_str(), format_timestamp(entry.started_at)],
        entry_from_row,
    )?;
    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row?);
    }

    let Some(existing) = find_exact_duplicate(entry, &candidates) else {
        return Ok(None);
    };
    if strict {
        return Err(ValidationError::DuplicateEntry {
            existing: existing.id.to_string(),
        }
        .into());
    }
    debug!(entry = %entry.id, existing = %existing.id, "duplicate interval flagged");
    Ok(Some(Finding::duplicate(entry, existing)))
}

/// Refuses changes to a day whose timesheet is approved or locked, otherwise
/// marks that timesheet for recompute.
fn touch_day(
    conn: &Connection,
    user: &UserId,
    workspace: &WorkspaceId,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    if let Some(timesheet) = timesheet_covering(conn, user, workspace, date)? {
        if !timesheet.status.is_editable() {
            return Err(tt_core::Error::invalid_transition(
                "timesheet",
                "change entries of",
                timesheet.status,
            )
            .into());
        }
        mark_dirty(conn, &timesheet.id, now)?;
    }
    Ok(())
}

/// Inserts a new entry inside the caller's transaction.
///
/// Timer entries are always accepted; landing in a frozen period is flagged
/// instead of refused so a timer can always stop.
pub(crate) fn persist_new_entry(
    conn: &Connection,
    entry: &TimeEntry,
    strict: bool,
    from_timer: bool,
) -> Result<Vec<Finding>, DbError> {
    let mut findings = Vec::new();
    findings.extend(check_duplicate(conn, entry, strict)?);

    let date = entry.started_at.date_naive();
    match timesheet_covering(conn, &entry.user, &entry.workspace, date)? {
        Some(timesheet) if !timesheet.status.is_editable() && from_timer => {
            findings.push(Finding::frozen_period(entry, &timesheet));
        }
        Some(_) | None => touch_day(conn, &entry.user, &entry.workspace, date, entry.created_at)?,
    }

    insert_entry(conn, entry)?;
    Ok(findings)
}

impl Database {
    /// Records a manual or imported entry.
    pub fn create_entry(&mut self, mut input: NewTimeEntry, now: DateTime<Utc>) -> Result<EntryOutcome, DbError> {
        if input.hourly_rate.is_none() {
            input.hourly_rate = self
                .catalog
                .canonical_rate(input.project.as_ref(), input.task.as_ref());
        }
        let strict = input.strict;
        let policy = self.policies.for_workspace(&input.workspace);
        let entry = record_manual(input, policy, self.catalog.as_ref(), now)?;

        let tx = immediate(&mut self.conn)?;
        let findings = persist_new_entry(&tx, &entry, strict, false)?;
        let exceptions = raise_findings(&tx, findings, now)?;
        tx.commit()?;

        info!(
            entry = %entry.id,
            user = %entry.user,
            minutes = entry.duration_minutes,
            provenance = %entry.provenance,
            "entry created"
        );
        Ok(EntryOutcome { entry, exceptions })
    }

    pub fn update_entry(
        &mut self,
        id: &TimeEntryId,
        changes: EntryChanges,
        now: DateTime<Utc>,
    ) -> Result<EntryOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut entry = load_entry(&tx, id)?;
        let policy = self.policies.for_workspace(&entry.workspace);
        let previous_day = entry.started_at.date_naive();
        let touches_interval = changes.touches_interval();

        apply_changes(&mut entry, changes, policy, self.catalog.as_ref(), now)?;
        touch_day(&tx, &entry.user, &entry.workspace, previous_day, now)?;
        let day = entry.started_at.date_naive();
        if day != previous_day {
            touch_day(&tx, &entry.user, &entry.workspace, day, now)?;
        }
        let findings = if touches_interval {
            check_duplicate(&tx, &entry, false)?.into_iter().collect()
        } else {
            Vec::new()
        };
        update_entry(&tx, &mut entry)?;
        let exceptions = raise_findings(&tx, findings, now)?;
        tx.commit()?;

        info!(entry = %entry.id, minutes = entry.duration_minutes, "entry updated");
        Ok(EntryOutcome { entry, exceptions })
    }

    pub fn delete_entry(&mut self, id: &TimeEntryId, now: DateTime<Utc>) -> Result<(), DbError> {
        let tx = immediate(&mut self.conn)?;
        let entry = load_entry(&tx, id)?;
        entry.ensure_mutable()?;
        touch_day(
            &tx,
            &entry.user,
            &entry.workspace,
            entry.started_at.date_naive(),
            now,
        )?;
        let changed = tx.execute(
            "DELETE FROM time_entries WHERE id = ? AND version = ?",
            params![entry.id.as_str(), entry.version],
        )?;
        ensure_written(changed, "time entry", entry.id.as_str())?;
        tx.commit()?;
        info!(entry = %entry.id, "entry deleted");
        Ok(())
    }

    pub fn entry(&self, id: &TimeEntryId) -> Result<TimeEntry, DbError> {
        load_entry(&self.conn, id)
    }

    /// Entries matching `filter`, ordered by start time.
    pub fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<TimeEntry>, DbError> {
        query_entries(&self.conn, filter)
    }
}
