//! Timesheet commands: aggregation, overrides and the approval workflow.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tt_core::{
    ApprovalRecord, DecisionRequest, Period, Timesheet, TimesheetEntry, TimesheetEntryId, TimesheetId,
    TimesheetStatus, Verdict, WorkspaceId,
};
use tt_db::{EscalationKind, TimesheetFilter, TimesheetOutcome};

use crate::commands::util::{format_instant, or_dash, write_exceptions, write_json};
use crate::session::Session;

pub fn aggregate<W: Write>(
    writer: &mut W,
    session: &mut Session,
    workspace: &WorkspaceId,
    period: Period,
    now: DateTime<Utc>,
) -> Result<()> {
    let user = session.user()?.clone();
    let outcome = session.db.aggregate(&user, workspace, period, now)?;
    write_outcome(writer, session.json, "Aggregated", &outcome)
}

/// Prints a timesheet, refreshing it first when entries changed.
pub fn show<W: Write>(writer: &mut W, session: &mut Session, id: &TimesheetId, now: DateTime<Utc>) -> Result<()> {
    let timesheet = session.db.timesheet(id, now)?;
    let buckets = session.db.timesheet_entries(id)?;

    if session.json {
        return write_json(writer, &json!({ "timesheet": timesheet, "buckets": buckets }));
    }
    writeln!(writer, "Timesheet {id}")?;
    write_summary(writer, &timesheet)?;
    if buckets.is_empty() {
        writeln!(writer, "No time recorded.")?;
        return Ok(());
    }
    writeln!(writer, "Buckets:")?;
    for bucket in &buckets {
        write_bucket(writer, bucket)?;
    }
    Ok(())
}

/// Lists timesheets; `all_users` widens the listing beyond the acting user.
pub fn list<W: Write>(
    writer: &mut W,
    session: &Session,
    workspace: Option<WorkspaceId>,
    status: Option<TimesheetStatus>,
    all_users: bool,
) -> Result<()> {
    let user = if all_users {
        None
    } else {
        Some(session.user()?.clone())
    };
    let timesheets = session.db.list_timesheets(&TimesheetFilter {
        user,
        workspace,
        status,
    })?;

    if session.json {
        return write_json(writer, &timesheets);
    }
    if timesheets.is_empty() {
        writeln!(writer, "No timesheets.")?;
        return Ok(());
    }
    for timesheet in &timesheets {
        writeln!(
            writer,
            "{}  {}  {}  {} to {}  {}  {:.2}h  {:.2}",
            timesheet.id,
            timesheet.user,
            timesheet.workspace,
            timesheet.period.start,
            timesheet.period.end,
            timesheet.status,
            timesheet.total_hours,
            timesheet.total_cost,
        )?;
    }
    Ok(())
}

pub fn submit<W: Write>(writer: &mut W, session: &mut Session, id: &TimesheetId, now: DateTime<Utc>) -> Result<()> {
    let workspace = session.db.timesheet(id, now)?.workspace;
    let actor = session.actor(&workspace)?;
    let outcome = session.db.submit(id, &actor, now)?;
    write_outcome(writer, session.json, "Submitted", &outcome)
}

/// Fields of `tt timesheet decide`.
#[derive(Debug, Clone)]
pub struct DecideArgs {
    pub verdict: Verdict,
    pub comments: Option<String>,
    pub approved_hours: Option<Decimal>,
    pub expected_version: Option<i64>,
}

pub fn decide<W: Write>(
    writer: &mut W,
    session: &mut Session,
    id: &TimesheetId,
    args: DecideArgs,
    now: DateTime<Utc>,
) -> Result<()> {
    let workspace = session.db.timesheet(id, now)?.workspace;
    let request = DecisionRequest {
        actor: session.actor(&workspace)?,
        verdict: args.verdict,
        comments: args.comments,
        approved_hours: args.approved_hours,
        expected_version: args.expected_version,
        at: now,
    };
    let outcome = session.db.decide(id, &request)?;
    write_outcome(writer, session.json, "Decided", &outcome)
}

pub fn lock<W: Write>(writer: &mut W, session: &mut Session, id: &TimesheetId, now: DateTime<Utc>) -> Result<()> {
    let workspace = session.db.timesheet(id, now)?.workspace;
    let actor = session.actor(&workspace)?;
    let outcome = session.db.lock(id, &actor, now)?;
    write_outcome(writer, session.json, "Locked", &outcome)
}

pub fn reopen<W: Write>(writer: &mut W, session: &mut Session, id: &TimesheetId, now: DateTime<Utc>) -> Result<()> {
    let workspace = session.db.timesheet(id, now)?.workspace;
    let actor = session.actor(&workspace)?;
    let timesheet = session.db.reopen(id, &actor, now)?;
    if session.json {
        return write_json(writer, &timesheet);
    }
    writeln!(writer, "Reopened timesheet {id} as {}", timesheet.status)?;
    Ok(())
}

/// Fields of `tt timesheet override`. All `None` clears the override.
#[derive(Debug, Clone, Default)]
pub struct OverrideArgs {
    pub hours: Option<Decimal>,
    pub rate: Option<Decimal>,
    pub notes: Option<String>,
}

pub fn set_override<W: Write>(
    writer: &mut W,
    session: &mut Session,
    bucket: &TimesheetEntryId,
    args: OverrideArgs,
    now: DateTime<Utc>,
) -> Result<()> {
    let outcome = session
        .db
        .set_override(bucket, args.hours, args.rate, args.notes, now)?;
    write_outcome(writer, session.json, "Adjusted", &outcome)
}

pub fn approvals<W: Write>(writer: &mut W, session: &Session, id: &TimesheetId) -> Result<()> {
    let records = session.db.approval_records(id)?;
    if session.json {
        return write_json(writer, &records);
    }
    if records.is_empty() {
        writeln!(writer, "Timesheet {id} was never submitted.")?;
        return Ok(());
    }
    for record in &records {
        write_record(writer, record)?;
    }
    Ok(())
}

/// Applies escalation policies to overdue steps of every workspace.
pub fn sweep<W: Write>(writer: &mut W, session: &mut Session, now: DateTime<Utc>) -> Result<()> {
    let escalations = session.db.sweep_approvals(now)?;
    if session.json {
        let rows: Vec<_> = escalations
            .iter()
            .map(|e| {
                let (action, to) = match &e.kind {
                    EscalationKind::AutoApproved => ("auto_approved", None),
                    EscalationKind::Escalated { to } => ("escalated", Some(to.to_string())),
                };
                json!({ "timesheet": e.timesheet, "step": e.step, "action": action, "to": to })
            })
            .collect();
        return write_json(writer, &rows);
    }
    if escalations.is_empty() {
        writeln!(writer, "No overdue approvals.")?;
        return Ok(());
    }
    for escalation in &escalations {
        match &escalation.kind {
            EscalationKind::AutoApproved => writeln!(
                writer,
                "Auto-approved step {} of timesheet {}",
                escalation.step + 1,
                escalation.timesheet
            )?,
            EscalationKind::Escalated { to } => writeln!(
                writer,
                "Escalated step {} of timesheet {} to {to}",
                escalation.step + 1,
                escalation.timesheet
            )?,
        }
    }
    Ok(())
}

fn write_outcome<W: Write>(writer: &mut W, json: bool, verb: &str, outcome: &TimesheetOutcome) -> Result<()> {
    if json {
        return write_json(
            writer,
            &json!({ "timesheet": outcome.timesheet, "exceptions": outcome.exceptions }),
        );
    }
    writeln!(writer, "{verb} timesheet {}", outcome.timesheet.id)?;
    write_summary(writer, &outcome.timesheet)?;
    write_exceptions(writer, &outcome.exceptions)
}

fn write_summary<W: Write>(writer: &mut W, timesheet: &Timesheet) -> Result<()> {
    writeln!(writer, "  owner: {} in {}", timesheet.user, timesheet.workspace)?;
    writeln!(
        writer,
        "  period: {} to {}",
        timesheet.period.start, timesheet.period.end
    )?;
    writeln!(
        writer,
        "  status: {} (round {}, version {})",
        timesheet.status, timesheet.round, timesheet.version
    )?;
    writeln!(
        writer,
        "  hours: {:.2} total, {:.2} billable, {:.2} overtime",
        timesheet.total_hours, timesheet.billable_hours, timesheet.overtime_hours
    )?;
    writeln!(writer, "  cost: {:.2}", timesheet.total_cost)?;
    if let Some(hours) = timesheet.approved_hours {
        writeln!(writer, "  approved hours: {hours:.2}")?;
    }
    if let (Some(at), Some(by)) = (timesheet.approved_at, &timesheet.approved_by) {
        writeln!(writer, "  approved: {} by {by}", format_instant(at))?;
    }
    if let (Some(at), Some(by)) = (timesheet.locked_at, &timesheet.locked_by) {
        writeln!(writer, "  locked: {} by {by}", format_instant(at))?;
    }
    Ok(())
}

fn write_bucket<W: Write>(writer: &mut W, bucket: &TimesheetEntry) -> Result<()> {
    write!(
        writer,
        "  {}  {}/{}  {:.2}h  {:.2}  [{}]",
        bucket.key.date,
        or_dash(bucket.key.project.as_ref()),
        or_dash(bucket.key.task.as_ref()),
        bucket.hours(),
        bucket.effective_cost(),
        bucket.id,
    )?;
    if bucket.override_hours.is_some() || bucket.override_rate.is_some() {
        write!(
            writer,
            "  override {}h @ {}",
            or_dash(bucket.override_hours),
            or_dash(bucket.override_rate)
        )?;
    }
    writeln!(writer)?;
    if let Some(notes) = &bucket.notes {
        writeln!(writer, "      {notes}")?;
    }
    Ok(())
}

fn write_record<W: Write>(writer: &mut W, record: &ApprovalRecord) -> Result<()> {
    write!(
        writer,
        "round {} step {}: {} {}",
        record.round,
        record.step + 1,
        record.approver,
        record.decision
    )?;
    if let Some(by) = &record.decided_by {
        write!(writer, " by {by}")?;
    }
    if let Some(at) = record.decided_at {
        write!(writer, " at {}", format_instant(at))?;
    }
    if let Some(from) = &record.escalated_from {
        write!(writer, " (escalated from {from})")?;
    }
    writeln!(writer)?;
    if let Some(comments) = &record.comments {
        writeln!(writer, "    {comments}")?;
    }
    Ok(())
}
