//! Approval workflow storage.
//!
//! A decision reads the timesheet and the records of its current round inside
//! one `IMMEDIATE` transaction and writes both back with a version check, so
//! two approvers racing on the final step produce exactly one transition.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tracing::{info, warn};
use tt_core::approval::{self, auto_approve, escalate, overdue_step};
use tt_core::{
    Actor, ApprovalRecord, ApproverSpec, DecisionOutcome, DecisionRequest, EscalationAction,
    Timesheet, TimesheetId, TimesheetStatus,
};

use crate::codec::{format_opt_decimal, format_opt_timestamp, opt_parsed, opt_timestamp, parsed};
use crate::exceptions::raise_findings;
use crate::timesheets::{load_timesheet, refresh_if_dirty, sync_entry_statuses, update_timesheet};
use crate::{Database, DbError, TimesheetOutcome, conflict_on_constraint, ensure_written, immediate};

/// What the approval sweep did to one overdue step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub timesheet: TimesheetId,
    pub step: u32,
    pub kind: EscalationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationKind {
    AutoApproved,
    Escalated { to: ApproverSpec },
}

const RECORD_COLUMNS: &str = "
    id, timesheet_id, round, step, approver, escalated_from, decision, decided_by, comments,
    approved_hours, opened_at, decided_at, version
";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    Ok(ApprovalRecord {
        id: parsed(row, 0)?,
        timesheet: parsed(row, 1)?,
        round: row.get(2)?,
        step: row.get(3)?,
        approver: parsed(row, 4)?,
        escalated_from: opt_parsed(row, 5)?,
        decision: parsed(row, 6)?,
        decided_by: opt_parsed(row, 7)?,
        comments: row.get(8)?,
        approved_hours: opt_parsed(row, 9)?,
        opened_at: opt_timestamp(row, 10)?,
        decided_at: opt_timestamp(row, 11)?,
        version: row.get(12)?,
    })
}

fn load_records(
    conn: &Connection,
    timesheet: &TimesheetId,
    round: Option<i64>,
) -> Result<Vec<ApprovalRecord>, DbError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM approval_records
         WHERE timesheet_id = ?1 AND (?2 IS NULL OR round = ?2)
         ORDER BY round ASC, step ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![timesheet.as_str(), round], record_from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn insert_record(conn: &Connection, record: &ApprovalRecord) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO approval_records ({RECORD_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            record.id.as_str(),
            record.timesheet.as_str(),
            record.round,
            record.step,
            record.approver.to_string(),
            record.escalated_from.as_ref().map(ToString::to_string),
            record.decision.as_str(),
            record.decided_by.as_ref().map(|u| u.as_str()),
            record.comments,
            format_opt_decimal(record.approved_hours),
            format_opt_timestamp(record.opened_at),
            format_opt_timestamp(record.decided_at),
            record.version,
        ],
    )
    .map_err(|err| {
        conflict_on_constraint(err, || {
            format!(
                "round {} of timesheet {} was already opened",
                record.round, record.timesheet
            )
        })
    })?;
    Ok(())
}

fn update_record(conn: &Connection, record: &mut ApprovalRecord) -> Result<(), DbError> {
    let changed = conn.execute(
        "
        UPDATE approval_records SET
            approver = ?, escalated_from = ?, decision = ?, decided_by = ?, comments = ?,
            approved_hours = ?, opened_at = ?, decided_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        ",
        params![
            record.approver.to_string(),
            record.escalated_from.as_ref().map(ToString::to_string),
            record.decision.as_str(),
            record.decided_by.as_ref().map(|u| u.as_str()),
            record.comments,
            format_opt_decimal(record.approved_hours),
            format_opt_timestamp(record.opened_at),
            format_opt_timestamp(record.decided_at),
            record.id.as_str(),
            record.version,
        ],
    )?;
    ensure_written(changed, "approval record", record.id.as_str())?;
    record.version += 1;
    Ok(())
}

/// Persists the records a decision touched, then the timesheet.
fn write_decision(
    conn: &Connection,
    timesheet: &mut Timesheet,
    records: &mut [ApprovalRecord],
    outcome: DecisionOutcome,
) -> Result<(), DbError> {
    update_record(conn, &mut records[outcome.decided])?;
    if let Some(opened) = outcome.opened {
        update_record(conn, &mut records[opened])?;
    }
    update_timesheet(conn, timesheet)?;
    sync_entry_statuses(conn, timesheet)
}

impl Database {
    /// draft → submitted, opening a new approval round.
    ///
    /// A dirty timesheet is re-aggregated first so approvers see fresh totals.
    pub fn submit(
        &mut self,
        id: &TimesheetId,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<TimesheetOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timesheet = load_timesheet(&tx, id)?;
        let policy = self.policies.for_workspace(&timesheet.workspace);
        let findings = refresh_if_dirty(&tx, &mut timesheet, policy, self.catalog.as_ref(), now)?;

        let records = approval::submit(&mut timesheet, actor, &policy.workflow, now)?;
        for record in &records {
            insert_record(&tx, record)?;
        }
        update_timesheet(&tx, &mut timesheet)?;
        sync_entry_statuses(&tx, &timesheet)?;
        let exceptions = raise_findings(&tx, findings, now)?;
        tx.commit()?;

        info!(
            timesheet = %timesheet.id,
            round = timesheet.round,
            steps = records.len(),
            total_hours = %timesheet.total_hours,
            "timesheet submitted"
        );
        Ok(TimesheetOutcome {
            timesheet,
            exceptions,
        })
    }

    /// Records an approver's decision on the current round.
    pub fn decide(
        &mut self,
        id: &TimesheetId,
        request: &DecisionRequest,
    ) -> Result<TimesheetOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timesheet = load_timesheet(&tx, id)?;
        let policy = self.policies.for_workspace(&timesheet.workspace);
        let findings =
            refresh_if_dirty(&tx, &mut timesheet, policy, self.catalog.as_ref(), request.at)?;

        let mut records = load_records(&tx, id, Some(timesheet.round))?;
        let outcome = approval::decide(&mut timesheet, &mut records, policy.workflow.kind, request)?;
        write_decision(&tx, &mut timesheet, &mut records, outcome)?;
        let exceptions = raise_findings(&tx, findings, request.at)?;
        tx.commit()?;

        info!(
            timesheet = %timesheet.id,
            by = %request.actor.user,
            verdict = ?request.verdict,
            status = %timesheet.status,
            "decision recorded"
        );
        Ok(TimesheetOutcome {
            timesheet,
            exceptions,
        })
    }

    /// approved → locked.
    ///
    /// Approved sheets are never re-aggregated, so locking raises no
    /// exceptions of its own.
    pub fn lock(&mut self, id: &TimesheetId, actor: &Actor, now: DateTime<Utc>) -> Result<TimesheetOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timesheet = load_timesheet(&tx, id)?;
        approval::lock(&mut timesheet, actor, now)?;
        update_timesheet(&tx, &mut timesheet)?;
        sync_entry_statuses(&tx, &timesheet)?;
        tx.commit()?;
        info!(timesheet = %timesheet.id, by = %actor.user, "timesheet locked");
        Ok(TimesheetOutcome {
            timesheet,
            exceptions: Vec::new(),
        })
    }

    /// rejected | changes requested → draft.
    pub fn reopen(&mut self, id: &TimesheetId, actor: &Actor, now: DateTime<Utc>) -> Result<Timesheet, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timesheet = load_timesheet(&tx, id)?;
        approval::reopen(&mut timesheet, actor, now)?;
        update_timesheet(&tx, &mut timesheet)?;
        sync_entry_statuses(&tx, &timesheet)?;
        tx.commit()?;
        info!(timesheet = %timesheet.id, "timesheet reopened");
        Ok(timesheet)
    }

    /// Approval records of every round, oldest first.
    pub fn approval_records(&self, id: &TimesheetId) -> Result<Vec<ApprovalRecord>, DbError> {
        load_timesheet(&self.conn, id)?;
        load_records(&self.conn, id, None)
    }

    /// Applies the workspace escalation policy to steps pending past their
    /// deadline. Workspaces without a policy are left alone.
    pub fn sweep_approvals(&mut self, now: DateTime<Utc>) -> Result<Vec<Escalation>, DbError> {
        let tx = immediate(&mut self.conn)?;
        let submitted: Vec<TimesheetId> = {
            let mut stmt = tx.prepare("SELECT id FROM timesheets WHERE status = ? ORDER BY id")?;
            let rows = stmt.query_map([TimesheetStatus::Submitted.as_str()], |row| parsed(row, 0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut escalations = Vec::new();
        for id in submitted {
            let mut timesheet = load_timesheet(&tx, &id)?;
            let policy = self.policies.for_workspace(&timesheet.workspace);
            let Some(escalation) = &policy.escalation else {
                continue;
            };
            let mut records = load_records(&tx, &id, Some(timesheet.round))?;
            let Some(index) = overdue_step(&records, escalation, now) else {
                continue;
            };
            let step = records[index].step;

            match &escalation.action {
                EscalationAction::AutoApprove => {
                    let outcome =
                        auto_approve(&mut timesheet, &mut records, index, policy.workflow.kind, now)?;
                    write_decision(&tx, &mut timesheet, &mut records, outcome)?;
                    warn!(timesheet = %id, step, "approval step auto-approved after deadline");
                    escalations.push(Escalation {
                        timesheet: id,
                        step,
                        kind: EscalationKind::AutoApproved,
                    });
                }
                EscalationAction::Escalate { to } => {
                    if escalate(&mut records[index], to, now) {
                        update_record(&tx, &mut records[index])?;
                        escalations.push(Escalation {
                            timesheet: id,
                            step,
                            kind: EscalationKind::Escalated { to: to.clone() },
                        });
                    }
                }
            }
        }
        tx.commit()?;
        Ok(escalations)
    }
}
