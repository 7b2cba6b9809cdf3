//! Timesheet storage and aggregation.
//!
//! Buckets are upserted by their deterministic id. The `INSERT ... ON
//! CONFLICT` never touches the override columns, so manual adjustments
//! survive every re-aggregation; buckets whose entries are gone are deleted.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info};
use tt_core::exception::scan_timesheet;
use tt_core::timesheet::{carry_overrides, compute_totals, plan_aggregation};
use tt_core::{
    BucketKey, Catalog, Finding, Period, Timesheet, TimesheetEntry, TimesheetEntryId,
    TimesheetId, TimesheetStatus, UserId, ValidationError, WorkspaceId, WorkspacePolicy,
};

use crate::codec::{
    format_opt_decimal, format_opt_timestamp, format_timestamp, opt_parsed, opt_timestamp,
    parsed, timestamp,
};
use crate::entries::{EntryFilter, query_entries};
use crate::exceptions::raise_findings;
use crate::{Database, DbError, TimesheetOutcome, conflict_on_constraint, ensure_written, immediate};

/// Selects timesheets for listing. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimesheetFilter {
    pub user: Option<UserId>,
    pub workspace: Option<WorkspaceId>,
    pub status: Option<TimesheetStatus>,
}

const TIMESHEET_COLUMNS: &str = "
    id, user_id, workspace_id, period_start, period_end, status, total_hours, billable_hours,
    overtime_hours, total_cost, approved_hours, round, submitted_at, submitted_by,
    approved_at, approved_by, locked_at, locked_by, needs_recompute, created_at, updated_at,
    version
";

fn timesheet_from_row(row: &Row<'_>) -> rusqlite::Result<Timesheet> {
    Ok(Timesheet {
        id: parsed(row, 0)?,
        user: parsed(row, 1)?,
        workspace: parsed(row, 2)?,
        period: Period {
            start: parsed(row, 3)?,
            end: parsed(row, 4)?,
        },
        status: parsed(row, 5)?,
        total_hours: parsed(row, 6)?,
        billable_hours: parsed(row, 7)?,
        overtime_hours: parsed(row, 8)?,
        total_cost: parsed(row, 9)?,
        approved_hours: opt_parsed(row, 10)?,
        round: row.get(11)?,
        submitted_at: opt_timestamp(row, 12)?,
        submitted_by: opt_parsed(row, 13)?,
        approved_at: opt_timestamp(row, 14)?,
        approved_by: opt_parsed(row, 15)?,
        locked_at: opt_timestamp(row, 16)?,
        locked_by: opt_parsed(row, 17)?,
        needs_recompute: row.get(18)?,
        created_at: timestamp(row, 19)?,
        updated_at: timestamp(row, 20)?,
        version: row.get(21)?,
    })
}

pub(crate) fn load_timesheet(conn: &Connection, id: &TimesheetId) -> Result<Timesheet, DbError> {
    let sql = format!("SELECT {TIMESHEET_COLUMNS} FROM timesheets WHERE id = ?");
    conn.query_row(&sql, [id.as_str()], timesheet_from_row)
        .optional()?
        .ok_or_else(|| tt_core::Error::not_found("timesheet", id).into())
}

fn overlapping_timesheets(
    conn: &Connection,
    user: &UserId,
    workspace: &WorkspaceId,
    period: &Period,
) -> Result<Vec<Timesheet>, DbError> {
    let sql = format!(
        "SELECT {TIMESHEET_COLUMNS} FROM timesheets
         WHERE user_id = ? AND workspace_id = ? AND period_start <= ? AND period_end >= ?
         ORDER BY period_start"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            user.as_str(),
            workspace.as_str(),
            period.end.to_string(),
            period.start.to_string()
        ],
        timesheet_from_row,
    )?;
    let mut timesheets = Vec::new();
    for row in rows {
        timesheets.push(row?);
    }
    Ok(timesheets)
}

/// The timesheet whose period contains `date`, if any.
pub(crate) fn timesheet_covering(
    conn: &Connection,
    user: &UserId,
    workspace: &WorkspaceId,
    date: NaiveDate,
) -> Result<Option<Timesheet>, DbError> {
    let day = Period {
        start: date,
        end: date,
    };
    Ok(overlapping_timesheets(conn, user, workspace, &day)?
        .into_iter()
        .next())
}

/// Flags a timesheet for recompute and bumps its version.
pub(crate) fn mark_dirty(conn: &Connection, id: &TimesheetId, now: DateTime<Utc>) -> Result<(), DbError> {
    conn.execute(
        "
        UPDATE timesheets
        SET needs_recompute = 1, updated_at = ?, version = version + 1
        WHERE id = ?
        ",
        params![format_timestamp(now), id.as_str()],
    )?;
    debug!(timesheet = %id, "timesheet marked for recompute");
    Ok(())
}

fn insert_timesheet(conn: &Connection, timesheet: &Timesheet) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO timesheets ({TIMESHEET_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            timesheet.id.as_str(),
            timesheet.user.as_str(),
            timesheet.workspace.as_str(),
            timesheet.period.start.to_string(),
            timesheet.period.end.to_string(),
            timesheet.status.as_str(),
            timesheet.total_hours.to_string(),
            timesheet.billable_hours.to_string(),
            timesheet.overtime_hours.to_string(),
            timesheet.total_cost.to_string(),
            format_opt_decimal(timesheet.approved_hours),
            timesheet.round,
            format_opt_timestamp(timesheet.submitted_at),
            timesheet.submitted_by.as_ref().map(|u| u.as_str()),
            format_opt_timestamp(timesheet.approved_at),
            timesheet.approved_by.as_ref().map(|u| u.as_str()),
            format_opt_timestamp(timesheet.locked_at),
            timesheet.locked_by.as_ref().map(|u| u.as_str()),
            timesheet.needs_recompute,
            format_timestamp(timesheet.created_at),
            format_timestamp(timesheet.updated_at),
            timesheet.version,
        ],
    )
    .map_err(|err| {
        conflict_on_constraint(err, || {
            format!(
                "a timesheet for {} starting {} already exists",
                timesheet.user, timesheet.period.start
            )
        })
    })?;
    Ok(())
}

/// Writes the mutable state of `timesheet` if its version is still current.
pub(crate) fn update_timesheet(conn: &Connection, timesheet: &mut Timesheet) -> Result<(), DbError> {
    let changed = conn.execute(
        "
        UPDATE timesheets SET
            status = ?, total_hours = ?, billable_hours = ?, overtime_hours = ?,
            total_cost = ?, approved_hours = ?, round = ?, submitted_at = ?, submitted_by = ?,
            approved_at = ?, approved_by = ?, locked_at = ?, locked_by = ?,
            needs_recompute = ?, updated_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        ",
        params![
            timesheet.status.as_str(),
            timesheet.total_hours.to_string(),
            timesheet.billable_hours.to_string(),
            timesheet.overtime_hours.to_string(),
            timesheet.total_cost.to_string(),
            format_opt_decimal(timesheet.approved_hours),
            timesheet.round,
            format_opt_timestamp(timesheet.submitted_at),
            timesheet.submitted_by.as_ref().map(|u| u.as_str()),
            format_opt_timestamp(timesheet.approved_at),
            timesheet.approved_by.as_ref().map(|u| u.as_str()),
            format_opt_timestamp(timesheet.locked_at),
            timesheet.locked_by.as_ref().map(|u| u.as_str()),
            timesheet.needs_recompute,
            format_timestamp(timesheet.updated_at),
            timesheet.id.as_str(),
            timesheet.version,
        ],
    )?;
    ensure_written(changed, "timesheet", timesheet.id.as_str())?;
    timesheet.version += 1;
    Ok(())
}

/// Moves every entry linked to the timesheet to the status its state implies.
pub(crate) fn sync_entry_statuses(conn: &Connection, timesheet: &Timesheet) -> Result<(), DbError> {
    let status = timesheet.status.entry_status();
    let changed = conn.execute(
        "
        UPDATE time_entries SET status = ?1, version = version + 1
        WHERE status != ?1 AND id IN (
            SELECT l.time_entry_id
            FROM timesheet_entry_links l
            JOIN timesheet_entries b ON b.id = l.timesheet_entry_id
            WHERE b.timesheet_id = ?2
        )
        ",
        params![status.as_str(), timesheet.id.as_str()],
    )?;
    if changed > 0 {
        debug!(timesheet = %timesheet.id, %status, entries = changed, "entry statuses updated");
    }
    Ok(())
}

const BUCKET_COLUMNS: &str = "
    id, timesheet_id, entry_date, project_id, task_id, description, minutes,
    billable_minutes, cost, override_hours, override_rate, notes
";

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<TimesheetEntry> {
    Ok(TimesheetEntry {
        id: parsed(row, 0)?,
        timesheet: parsed(row, 1)?,
        key: BucketKey {
            date: parsed(row, 2)?,
            project: opt_parsed(row, 3)?,
            task: opt_parsed(row, 4)?,
        },
        description: row.get(5)?,
        minutes: row.get(6)?,
        billable_minutes: row.get(7)?,
        cost: parsed(row, 8)?,
        override_hours: opt_parsed(row, 9)?,
        override_rate: opt_parsed(row, 10)?,
        notes: row.get(11)?,
        time_entries: Vec::new(),
    })
}

fn load_links(conn: &Connection, bucket: &mut TimesheetEntry) -> Result<(), DbError> {
    let mut stmt = conn.prepare_cached(
        "
        SELECT l.time_entry_id
        FROM timesheet_entry_links l
        JOIN time_entries e ON e.id = l.time_entry_id
        WHERE l.timesheet_entry_id = ?
        ORDER BY e.started_at ASC, e.id ASC
        ",
    )?;
    let rows = stmt.query_map([bucket.id.as_str()], |row| parsed(row, 0))?;
    for row in rows {
        bucket.time_entries.push(row?);
    }
    Ok(())
}

fn load_buckets(conn: &Connection, timesheet: &TimesheetId) -> Result<Vec<TimesheetEntry>, DbError> {
    let sql = format!(
        "SELECT {BUCKET_COLUMNS} FROM timesheet_entries
         WHERE timesheet_id = ?
         ORDER BY entry_date, project_id, task_id"
    );
    let mut buckets = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([timesheet.as_str()], bucket_from_row)?;
        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        buckets
    };
    for bucket in &mut buckets {
        load_links(conn, bucket)?;
    }
    Ok(buckets)
}

fn load_bucket(conn: &Connection, id: &TimesheetEntryId) -> Result<TimesheetEntry, DbError> {
    let sql = format!("SELECT {BUCKET_COLUMNS} FROM timesheet_entries WHERE id = ?");
    let mut bucket = conn
        .query_row(&sql, [id.as_str()], bucket_from_row)
        .optional()?
        .ok_or_else(|| tt_core::Error::not_found("timesheet entry", id))?;
    load_links(conn, &mut bucket)?;
    Ok(bucket)
}

fn upsert_bucket(conn: &Connection, bucket: &TimesheetEntry) -> Result<(), DbError> {
    conn.execute(
        "
        INSERT INTO timesheet_entries (
            id, timesheet_id, entry_date, project_id, task_id, description, minutes,
            billable_minutes, cost
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            description = excluded.description,
            minutes = excluded.minutes,
            billable_minutes = excluded.billable_minutes,
            cost = excluded.cost
        ",
        params![
            bucket.id.as_str(),
            bucket.timesheet.as_str(),
            bucket.key.date.to_string(),
            bucket.key.project.as_ref().map(|p| p.as_str()),
            bucket.key.task.as_ref().map(|t| t.as_str()),
            bucket.description,
            bucket.minutes,
            bucket.billable_minutes,
            bucket.cost.to_string(),
        ],
    )?;
    conn.execute(
        "DELETE FROM timesheet_entry_links WHERE timesheet_entry_id = ?",
        [bucket.id.as_str()],
    )?;
    let mut link = conn.prepare_cached(
        "INSERT INTO timesheet_entry_links (timesheet_entry_id, time_entry_id) VALUES (?, ?)",
    )?;
    for entry in &bucket.time_entries {
        link.execute(params![bucket.id.as_str(), entry.as_str()])?;
    }
    Ok(())
}

/// Rebuilds buckets and totals from the timesheet's current entries.
///
/// Returns the findings of a full scan of the refreshed timesheet.
pub(crate) fn recompute(
    conn: &Connection,
    timesheet: &mut Timesheet,
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
    now: DateTime<Utc>,
) -> Result<Vec<Finding>, DbError> {
    timesheet.ensure_aggregatable()?;
    let entries = query_entries(
        conn,
        &EntryFilter {
            user: Some(timesheet.user.clone()),
            workspace: Some(timesheet.workspace.clone()),
            from: Some(timesheet.period.start_instant()),
            to: Some(timesheet.period.end_instant_exclusive()),
        },
    )?;

    let stored = load_buckets(conn, &timesheet.id)?;
    let mut planned = plan_aggregation(timesheet, &entries, policy.description_limit);
    carry_overrides(&mut planned, &stored);

    let stale: Vec<&str> = stored
        .iter()
        .filter(|s| !planned.iter().any(|p| p.id == s.id))
        .map(|s| s.id.as_str())
        .collect();
    if !stale.is_empty() {
        let placeholders = vec!["?"; stale.len()].join(", ");
        conn.execute(
            &format!("DELETE FROM timesheet_entries WHERE id IN ({placeholders})"),
            params_from_iter(stale.iter()),
        )?;
    }
    for bucket in &planned {
        upsert_bucket(conn, bucket)?;
    }

    let totals = compute_totals(&planned, policy);
    timesheet.apply_totals(&totals, now);
    update_timesheet(conn, timesheet)?;
    sync_entry_statuses(conn, timesheet)?;

    info!(
        timesheet = %timesheet.id,
        buckets = planned.len(),
        removed = stale.len(),
        total_hours = %timesheet.total_hours,
        total_cost = %timesheet.total_cost,
        "timesheet aggregated"
    );
    Ok(scan_timesheet(
        timesheet,
        &entries,
        policy,
        catalog,
        now.date_naive(),
    ))
}

/// Recomputes `timesheet` when entries changed since its last aggregation.
pub(crate) fn refresh_if_dirty(
    conn: &Connection,
    timesheet: &mut Timesheet,
    policy: &WorkspacePolicy,
    catalog: &dyn Catalog,
    now: DateTime<Utc>,
) -> Result<Vec<Finding>, DbError> {
    if timesheet.needs_recompute && timesheet.status.is_editable() {
        recompute(conn, timesheet, policy, catalog, now)
    } else {
        Ok(Vec::new())
    }
}

impl Database {
    /// Creates or refreshes the user's timesheet for `period`.
    ///
    /// The identical period updates the existing timesheet; any other overlap
    /// with a timesheet of the same user and workspace is refused.
    pub fn aggregate(
        &mut self,
        user: &UserId,
        workspace: &WorkspaceId,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<TimesheetOutcome, DbError> {
        let policy = self.policies.for_workspace(workspace);
        let tx = immediate(&mut self.conn)?;

        let overlapping = overlapping_timesheets(&tx, user, workspace, &period)?;
        let mut timesheet = match overlapping.as_slice() {
            [] => {
                let timesheet = Timesheet::new(user.clone(), workspace.clone(), period, now);
                insert_timesheet(&tx, &timesheet)?;
                debug!(timesheet = %timesheet.id, %period, "timesheet created");
                timesheet
            }
            [existing] if existing.period == period => existing.clone(),
            [existing, ..] => {
                return Err(ValidationError::PeriodOverlap {
                    start: period.start,
                    end: period.end,
                    existing: existing.id.to_string(),
                }
                .into());
            }
        };

        let findings = recompute(&tx, &mut timesheet, policy, self.catalog.as_ref(), now)?;
        let exceptions = raise_findings(&tx, findings, now)?;
        tx.commit()?;
        Ok(TimesheetOutcome {
            timesheet,
            exceptions,
        })
    }

    /// Loads a timesheet, re-aggregating it first if it is dirty.
    pub fn timesheet(&mut self, id: &TimesheetId, now: DateTime<Utc>) -> Result<Timesheet, DbError> {
        let current = load_timesheet(&self.conn, id)?;
        if !(current.needs_recompute && current.status.is_editable()) {
            return Ok(current);
        }

        let tx = immediate(&mut self.conn)?;
        let mut timesheet = load_timesheet(&tx, id)?;
        let policy = self.policies.for_workspace(&timesheet.workspace);
        let findings = refresh_if_dirty(&tx, &mut timesheet, policy, self.catalog.as_ref(), now)?;
        raise_findings(&tx, findings, now)?;
        tx.commit()?;
        Ok(timesheet)
    }

    /// Buckets of a timesheet, ordered by date, project and task.
    pub fn timesheet_entries(&self, id: &TimesheetId) -> Result<Vec<TimesheetEntry>, DbError> {
        load_timesheet(&self.conn, id)?;
        load_buckets(&self.conn, id)
    }

    pub fn list_timesheets(&self, filter: &TimesheetFilter) -> Result<Vec<Timesheet>, DbError> {
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
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.to_string());
        }
        let mut sql = format!("SELECT {TIMESHEET_COLUMNS} FROM timesheets");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY period_start DESC, user_id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), timesheet_from_row)?;
        let mut timesheets = Vec::new();
        for row in rows {
            timesheets.push(row?);
        }
        Ok(timesheets)
    }

    /// Sets or clears the manual adjustment of one bucket and refreshes totals.
    pub fn set_override(
        &mut self,
        bucket: &TimesheetEntryId,
        hours: Option<Decimal>,
        rate: Option<Decimal>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TimesheetOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut entry = load_bucket(&tx, bucket)?;
        let mut timesheet = load_timesheet(&tx, &entry.timesheet)?;
        if !timesheet.status.is_editable() {
            return Err(tt_core::Error::invalid_transition(
                "timesheet",
                "override",
                timesheet.status,
            )
            .into());
        }
        let policy = self.policies.for_workspace(&timesheet.workspace);

        entry.set_override(hours, rate, notes)?;
        tx.execute(
            "
            UPDATE timesheet_entries
            SET override_hours = ?, override_rate = ?, notes = ?
            WHERE id = ?
            ",
            params![
                format_opt_decimal(entry.override_hours),
                format_opt_decimal(entry.override_rate),
                entry.notes,
                entry.id.as_str(),
            ],
        )?;
        let findings = recompute(&tx, &mut timesheet, policy, self.catalog.as_ref(), now)?;
        let exceptions = raise_findings(&tx, findings, now)?;
        tx.commit()?;

        info!(
            bucket = %entry.id,
            hours = ?entry.override_hours,
            rate = ?entry.override_rate,
            "timesheet entry override set"
        );
        Ok(TimesheetOutcome {
            timesheet,
            exceptions,
        })
    }
}
