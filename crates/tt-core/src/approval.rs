//! Approval workflow state machine.
//!
//! ```text
//!   draft ──submit──► submitted ──approve (last step)──► approved ──lock──► locked
//!     ▲                   │
//!     │                   ├──reject──────────► rejected ──reopen──┐
//!     └──request changes──┘                                       │
//!     ▲                                                           │
//!     └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Each submission opens a new round of [`ApprovalRecord`]s, one per workflow
//! step. Records of earlier rounds are never touched again.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result, ValidationError};
use crate::policy::{Actor, ApproverSpec, EscalationPolicy, WorkflowDefinition};
use crate::timesheet::Timesheet;
use crate::types::{ApprovalRecordId, Decision, TimesheetId, TimesheetStatus, UserId, WorkflowKind};

/// One approver's decision within a timesheet's workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: ApprovalRecordId,
    pub timesheet: TimesheetId,
    pub round: i64,
    pub step: u32,
    pub approver: ApproverSpec,
    /// The approver the step was originally assigned to, once escalated.
    pub escalated_from: Option<ApproverSpec>,
    pub decision: Decision,
    pub decided_by: Option<UserId>,
    pub comments: Option<String>,
    pub approved_hours: Option<Decimal>,
    /// When the step became decidable. `None` for sequential steps still
    /// waiting on an earlier one.
    pub opened_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl ApprovalRecord {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }
}

/// What an approver wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
    RequestChanges,
}

impl Verdict {
    const fn decision(self) -> Decision {
        match self {
            Self::Approve => Decision::Approved,
            Self::Reject => Decision::Rejected,
            Self::RequestChanges => Decision::ChangesRequested,
        }
    }

    const fn action(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::RequestChanges => "request changes",
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            "request_changes" | "request-changes" | "changes_requested" => Ok(Self::RequestChanges),
            _ => Err(ValidationError::UnknownVariant {
                field: "verdict",
                value: s.to_string(),
            }),
        }
    }
}

/// A decision on a submitted timesheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRequest {
    pub actor: Actor,
    pub verdict: Verdict,
    pub comments: Option<String>,
    pub approved_hours: Option<Decimal>,
    /// Fail with a conflict unless the timesheet is still at this version.
    pub expected_version: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Indexes into the round's records touched by a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub decided: usize,
    /// The next sequential step, opened by this approval.
    pub opened: Option<usize>,
}

/// draft → submitted. Returns the records of the new round.
pub fn submit(
    timesheet: &mut Timesheet,
    actor: &Actor,
    workflow: &WorkflowDefinition,
    at: DateTime<Utc>,
) -> Result<Vec<ApprovalRecord>> {
    if timesheet.status != TimesheetStatus::Draft {
        return Err(Error::invalid_transition("timesheet", "submit", timesheet.status));
    }
    if actor.user != timesheet.user {
        return Err(Error::permission_denied(
            "only the owner may submit a timesheet",
        ));
    }
    if timesheet.total_hours <= Decimal::ZERO {
        return Err(ValidationError::NothingToSubmit.into());
    }

    timesheet.round += 1;
    timesheet.status = TimesheetStatus::Submitted;
    timesheet.submitted_at = Some(at);
    timesheet.submitted_by = Some(actor.user.clone());
    timesheet.approved_at = None;
    timesheet.approved_by = None;
    timesheet.approved_hours = None;
    timesheet.updated_at = at;

    let records = workflow
        .steps
        .iter()
        .zip(0_u32..)
        .map(|(approver, step)| ApprovalRecord {
            id: ApprovalRecordId::generate(),
            timesheet: timesheet.id.clone(),
            round: timesheet.round,
            step,
            approver: approver.clone(),
            escalated_from: None,
            decision: Decision::Pending,
            decided_by: None,
            comments: None,
            approved_hours: None,
            opened_at: (workflow.kind == WorkflowKind::Parallel || step == 0).then_some(at),
            decided_at: None,
            version: 0,
        })
        .collect();
    info!(timesheet = %timesheet.id, round = timesheet.round, "timesheet submitted");
    Ok(records)
}

/// Records `request` on the step the actor may decide.
///
/// `records` are the current round's records, ordered by step.
pub fn decide(
    timesheet: &mut Timesheet,
    records: &mut [ApprovalRecord],
    kind: WorkflowKind,
    request: &DecisionRequest,
) -> Result<DecisionOutcome> {
    if request.actor.user == timesheet.user {
        return Err(Error::permission_denied(
            "an approver may not decide their own timesheet",
        ));
    }
    if let Some(expected) = request.expected_version {
        if expected != timesheet.version {
            return Err(Error::conflict(format!(
                "timesheet {} is at version {}, expected {expected}",
                timesheet.id, timesheet.version
            )));
        }
    }
    ensure_decidable(timesheet, records)?;

    let mut eligible = records
        .iter()
        .enumerate()
        .filter(|(_, r)| request.actor.may_decide(&r.approver))
        .peekable();
    if eligible.peek().is_none() {
        return Err(Error::permission_denied(format!(
            "{} is not an approver of timesheet {}",
            request.actor.user, timesheet.id
        )));
    }
    let Some(index) = eligible
        .find(|(_, r)| r.is_pending())
        .map(|(index, _)| index)
    else {
        return Err(Error::conflict(format!(
            "the step of {} on timesheet {} is already decided",
            request.actor.user, timesheet.id
        )));
    };
    if records
        .iter()
        .any(|r| r.decided_by.as_ref() == Some(&request.actor.user))
    {
        return Err(Error::permission_denied(format!(
            "{} already decided a step of this round",
            request.actor.user
        )));
    }

    decide_step(timesheet, records, index, kind, request)
}

/// Decides `records[index]` on behalf of the system, skipping the approver
/// check. Used by the escalation sweep.
pub fn auto_approve(
    timesheet: &mut Timesheet,
    records: &mut [ApprovalRecord],
    index: usize,
    kind: WorkflowKind,
    at: DateTime<Utc>,
) -> Result<DecisionOutcome> {
    ensure_decidable(timesheet, records)?;
    let request = DecisionRequest {
        actor: Actor::system(),
        verdict: Verdict::Approve,
        comments: Some("approved automatically after the escalation deadline".to_string()),
        approved_hours: None,
        expected_version: None,
        at,
    };
    decide_step(timesheet, records, index, kind, &request)
}

fn ensure_decidable(timesheet: &Timesheet, records: &[ApprovalRecord]) -> Result<()> {
    match timesheet.status {
        TimesheetStatus::Submitted => Ok(()),
        TimesheetStatus::Approved | TimesheetStatus::Rejected => Err(Error::conflict(format!(
            "timesheet {} was already {}",
            timesheet.id, timesheet.status
        ))),
        TimesheetStatus::Draft | TimesheetStatus::ChangesRequested
            if records
                .iter()
                .any(|r| r.decision == Decision::ChangesRequested) =>
        {
            Err(Error::conflict(format!(
                "changes were already requested on timesheet {}",
                timesheet.id
            )))
        }
        status => Err(Error::invalid_transition("timesheet", "decide", status)),
    }
}

fn decide_step(
    timesheet: &mut Timesheet,
    records: &mut [ApprovalRecord],
    index: usize,
    kind: WorkflowKind,
    request: &DecisionRequest,
) -> Result<DecisionOutcome> {
    let Some(record) = records.get(index) else {
        return Err(Error::not_found("approval step", index));
    };
    if !record.is_pending() {
        return Err(Error::conflict(format!("step {} is already decided", record.step)));
    }
    if kind == WorkflowKind::Sequential {
        if let Some(blocking) = records[..index].iter().find(|r| r.decision != Decision::Approved) {
            return Err(Error::invalid_transition(
                "approval step",
                "decide",
                format!("waiting on step {}", blocking.step),
            ));
        }
    }

    let comments = request
        .comments
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    if request.verdict != Verdict::Approve && comments.is_none() {
        return Err(ValidationError::CommentsRequired {
            action: request.verdict.action(),
        }
        .into());
    }
    if let Some(hours) = request.approved_hours {
        if request.verdict != Verdict::Approve
            || (hours.is_sign_negative() && !hours.is_zero())
            || hours > timesheet.total_hours
        {
            return Err(ValidationError::ApprovedHoursOutOfRange {
                approved: hours,
                total: timesheet.total_hours,
            }
            .into());
        }
    }

    let record = &mut records[index];
    record.decision = request.verdict.decision();
    record.decided_by = Some(request.actor.user.clone());
    record.comments = comments;
    record.approved_hours = request.approved_hours;
    record.decided_at = Some(request.at);
    debug!(
        timesheet = %timesheet.id,
        step = record.step,
        decision = %record.decision,
        by = %request.actor.user,
        "approval step decided"
    );

    let mut opened = None;
    match request.verdict {
        Verdict::Reject => timesheet.status = TimesheetStatus::Rejected,
        Verdict::RequestChanges => timesheet.status = TimesheetStatus::Draft,
        Verdict::Approve if records.iter().all(|r| r.decision == Decision::Approved) => {
            timesheet.status = TimesheetStatus::Approved;
            timesheet.approved_at = Some(request.at);
            timesheet.approved_by = Some(request.actor.user.clone());
            timesheet.approved_hours = records.iter().rev().find_map(|r| r.approved_hours);
        }
        Verdict::Approve => {
            if kind == WorkflowKind::Sequential {
                if let Some(next) = records.get_mut(index + 1) {
                    next.opened_at = Some(request.at);
                    opened = Some(index + 1);
                }
            }
        }
    }
    timesheet.updated_at = request.at;
    if timesheet.status != TimesheetStatus::Submitted {
        info!(timesheet = %timesheet.id, status = %timesheet.status, "timesheet decided");
    }
    Ok(DecisionOutcome {
        decided: index,
        opened,
    })
}

/// approved → locked. Irreversible.
pub fn lock(timesheet: &mut Timesheet, actor: &Actor, at: DateTime<Utc>) -> Result<()> {
    if timesheet.status != TimesheetStatus::Approved {
        return Err(Error::invalid_transition("timesheet", "lock", timesheet.status));
    }
    if !actor.is_approver() {
        return Err(Error::permission_denied(format!(
            "{} may not lock timesheets",
            actor.user
        )));
    }
    timesheet.status = TimesheetStatus::Locked;
    timesheet.locked_at = Some(at);
    timesheet.locked_by = Some(actor.user.clone());
    timesheet.updated_at = at;
    info!(timesheet = %timesheet.id, by = %actor.user, "timesheet locked");
    Ok(())
}

/// rejected | changes requested → draft, by the owner.
pub fn reopen(timesheet: &mut Timesheet, actor: &Actor, at: DateTime<Utc>) -> Result<()> {
    if !matches!(
        timesheet.status,
        TimesheetStatus::Rejected | TimesheetStatus::ChangesRequested
    ) {
        return Err(Error::invalid_transition("timesheet", "reopen", timesheet.status));
    }
    if actor.user != timesheet.user {
        return Err(Error::permission_denied("only the owner may reopen a timesheet"));
    }
    timesheet.status = TimesheetStatus::Draft;
    timesheet.updated_at = at;
    debug!(timesheet = %timesheet.id, "timesheet reopened");
    Ok(())
}

/// The open pending step whose deadline has passed, if any.
pub fn overdue_step(
    records: &[ApprovalRecord],
    escalation: &EscalationPolicy,
    now: DateTime<Utc>,
) -> Option<usize> {
    let deadline = Duration::hours(escalation.deadline_hours);
    records.iter().position(|r| {
        r.is_pending() && r.opened_at.is_some_and(|opened| now - opened > deadline)
    })
}

/// Reassigns a step to `to`, restarting its deadline. Returns `false` when
/// the step already belongs to `to`.
pub fn escalate(record: &mut ApprovalRecord, to: &ApproverSpec, now: DateTime<Utc>) -> bool {
    if &record.approver == to {
        return false;
    }
    let previous = std::mem::replace(&mut record.approver, to.clone());
    record.escalated_from.get_or_insert(previous);
    record.opened_at = Some(now);
    info!(
        timesheet = %record.timesheet,
        step = record.step,
        to = %record.approver,
        "approval step escalated"
    );
    true
}
