//! Core domain logic for time tracking and timesheet approval.
//!
//! This crate contains the types and pure logic for:
//! - Timers: the running/paused/stopped state machine and idle detection
//! - Time entries: validation, duration and fixed-point cost
//! - Timesheets: grouping entries into `(date, project, task)` buckets
//! - Approval: multi-step workflows over submitted timesheets
//! - Exceptions: overtime, missing time, overlapping entries, rate mismatches
//!
//! Nothing here performs I/O; storage lives in `tt-db`.

pub mod approval;
pub mod entry;
pub mod error;
pub mod exception;
pub mod idle;
pub mod money;
pub mod policy;
pub mod timer;
pub mod timesheet;
pub mod types;

pub use approval::{ApprovalRecord, DecisionOutcome, DecisionRequest, Verdict};
pub use entry::{EntryChanges, NewTimeEntry, TimeEntry};
pub use error::{Error, ErrorKind, Result, ValidationError};
pub use exception::{Exception, Finding, Subject};
pub use idle::{IdleCheck, IdlePeriod};
pub use policy::{
    Actor, ApproverSpec, Catalog, EscalationAction, EscalationPolicy, Policies, StaticCatalog,
    WorkCalendar, WorkflowDefinition, WorkspacePolicy,
};
pub use timer::{ActiveTime, ClampReason, PauseSpan, StartTimer, Timer};
pub use timesheet::{BucketKey, Period, Timesheet, TimesheetEntry, Totals};
pub use types::{
    ApprovalRecordId, Decision, EntryStatus, ExceptionId, ExceptionKind, ExceptionStatus,
    IdlePeriodId, IdleReason, PauseReason, ProjectId, Provenance, Role, Severity, TaskId,
    TimeEntryId, TimerId, TimerStatus, TimesheetEntryId, TimesheetId, TimesheetStatus, UserId,
    WorkflowKind, WorkspaceId,
};
