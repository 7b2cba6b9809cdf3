//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tt_core::{
    ExceptionId, ExceptionStatus, IdleReason, ProjectId, TaskId, TimeEntryId, TimesheetEntryId, TimesheetId,
    TimesheetStatus, UserId, Verdict, WorkspaceId,
};

/// Time tracking, timesheets and approvals.
///
/// Records timers and manual entries, aggregates them into periodic
/// timesheets, routes timesheets through approval and flags anomalies.
#[derive(Debug, Parser)]
#[command(name = "tt", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Act as this user instead of the configured one.
    #[arg(short, long, global = true)]
    pub user: Option<UserId>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the acting user's timer, timesheets and open exceptions.
    Status,

    /// Control the running timer.
    #[command(subcommand)]
    Timer(TimerAction),

    /// Record and edit time entries.
    #[command(subcommand)]
    Entry(EntryAction),

    /// Aggregate, submit and approve timesheets.
    #[command(subcommand)]
    Timesheet(TimesheetAction),

    /// Scan for and review anomalies.
    #[command(subcommand)]
    Exceptions(ExceptionAction),
}

/// When an action happened. Defaults to now.
#[derive(Debug, Clone, Args)]
pub struct AtArg {
    /// ISO 8601 instant or relative time such as "10 minutes ago".
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TimerAction {
    /// Start a timer.
    Start {
        #[arg(short, long)]
        workspace: WorkspaceId,
        #[arg(short, long)]
        project: Option<ProjectId>,
        #[arg(short, long)]
        task: Option<TaskId>,
        #[arg(short, long)]
        description: Option<String>,
        /// Hourly rate; defaults to the catalog rate.
        #[arg(long)]
        rate: Option<Decimal>,
        #[arg(long)]
        non_billable: bool,
        #[command(flatten)]
        at: AtArg,
    },
    /// Pause the running timer.
    Pause {
        #[command(flatten)]
        at: AtArg,
    },
    /// Resume the paused timer.
    Resume {
        #[command(flatten)]
        at: AtArg,
    },
    /// Stop the timer and record its entry.
    Stop {
        #[command(flatten)]
        at: AtArg,
    },
    /// Show the live timer and whether it is idle.
    Show {
        #[command(flatten)]
        at: AtArg,
    },
    /// Report user activity; a long gap auto-pauses the timer.
    Activity {
        #[command(flatten)]
        at: AtArg,
    },
    /// Record a closed idle span to subtract from the timer.
    Idle {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, value_enum, default_value_t = IdleReasonArg::Manual)]
        reason: IdleReasonArg,
    },
    /// Auto-pause every idle timer.
    Sweep {
        #[command(flatten)]
        at: AtArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IdleReasonArg {
    Inactivity,
    Lock,
    Manual,
}

impl From<IdleReasonArg> for IdleReason {
    fn from(arg: IdleReasonArg) -> Self {
        match arg {
            IdleReasonArg::Inactivity => Self::Inactivity,
            IdleReasonArg::Lock => Self::Lock,
            IdleReasonArg::Manual => Self::Manual,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum EntryAction {
    /// Record a manual entry.
    Add {
        #[arg(short, long)]
        workspace: WorkspaceId,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(short, long)]
        project: Option<ProjectId>,
        #[arg(short, long)]
        task: Option<TaskId>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long)]
        rate: Option<Decimal>,
        #[arg(long)]
        non_billable: bool,
        /// Tag to attach; repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Mark the entry as imported rather than manual.
        #[arg(long)]
        imported: bool,
        /// Refuse an exact duplicate instead of flagging it.
        #[arg(long)]
        strict: bool,
    },
    /// List entries of the acting user.
    List {
        #[arg(short, long)]
        workspace: Option<WorkspaceId>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Change an entry.
    Edit {
        id: TimeEntryId,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long)]
        rate: Option<Decimal>,
        #[arg(long)]
        billable: Option<bool>,
    },
    /// Delete an entry.
    Delete { id: TimeEntryId },
}

/// A timesheet period: a week, or explicit inclusive dates.
#[derive(Debug, Clone, Args)]
pub struct PeriodArgs {
    /// Any date of the Monday-to-Sunday week to cover (YYYY-MM-DD).
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub week: Option<String>,
    /// First day (YYYY-MM-DD).
    #[arg(long, requires = "to")]
    pub from: Option<String>,
    /// Last day, inclusive (YYYY-MM-DD).
    #[arg(long, requires = "from")]
    pub to: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TimesheetAction {
    /// Create or refresh the acting user's timesheet for a period.
    Aggregate {
        #[arg(short, long)]
        workspace: WorkspaceId,
        #[command(flatten)]
        period: PeriodArgs,
    },
    /// Show a timesheet and its buckets.
    Show { id: TimesheetId },
    /// List timesheets.
    List {
        #[arg(short, long)]
        workspace: Option<WorkspaceId>,
        #[arg(long, value_enum)]
        status: Option<TimesheetStatusArg>,
        /// Include every user, not only the acting one.
        #[arg(long)]
        all_users: bool,
    },
    /// Submit a draft timesheet for approval.
    Submit { id: TimesheetId },
    /// Decide the acting user's approval step.
    Decide {
        id: TimesheetId,
        #[arg(long, value_enum)]
        verdict: VerdictArg,
        #[arg(long)]
        comments: Option<String>,
        /// Hours granted, when different from the total.
        #[arg(long)]
        approved_hours: Option<Decimal>,
        /// Fail unless the timesheet is still at this version.
        #[arg(long)]
        expected_version: Option<i64>,
    },
    /// Lock an approved timesheet.
    Lock { id: TimesheetId },
    /// Move a rejected timesheet back to draft.
    Reopen { id: TimesheetId },
    /// Adjust one bucket's hours or rate.
    Override {
        /// Bucket id, as printed by `timesheet show`.
        bucket: TimesheetEntryId,
        #[arg(long)]
        hours: Option<Decimal>,
        #[arg(long)]
        rate: Option<Decimal>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List approval records of every round.
    Approvals { id: TimesheetId },
    /// Apply escalation policies to overdue approval steps.
    Sweep {
        #[command(flatten)]
        at: AtArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VerdictArg {
    Approve,
    Reject,
    RequestChanges,
}

impl From<VerdictArg> for Verdict {
    fn from(arg: VerdictArg) -> Self {
        match arg {
            VerdictArg::Approve => Self::Approve,
            VerdictArg::Reject => Self::Reject,
            VerdictArg::RequestChanges => Self::RequestChanges,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TimesheetStatusArg {
    Draft,
    Submitted,
    Approved,
    Rejected,
    ChangesRequested,
    Locked,
}

impl From<TimesheetStatusArg> for TimesheetStatus {
    fn from(arg: TimesheetStatusArg) -> Self {
        match arg {
            TimesheetStatusArg::Draft => Self::Draft,
            TimesheetStatusArg::Submitted => Self::Submitted,
            TimesheetStatusArg::Approved => Self::Approved,
            TimesheetStatusArg::Rejected => Self::Rejected,
            TimesheetStatusArg::ChangesRequested => Self::ChangesRequested,
            TimesheetStatusArg::Locked => Self::Locked,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ExceptionAction {
    /// Run the anomaly rules over a timesheet, a user or a workspace.
    Scan {
        #[arg(long, conflicts_with_all = ["workspace", "all_users"])]
        timesheet: Option<TimesheetId>,
        #[arg(short, long, required_unless_present = "timesheet")]
        workspace: Option<WorkspaceId>,
        /// Scan every user of the workspace.
        #[arg(long)]
        all_users: bool,
        #[command(flatten)]
        period: PeriodArgs,
    },
    /// List exceptions.
    List {
        #[arg(long, value_enum)]
        status: Option<ExceptionStatusArg>,
        /// Include every user, not only the acting one.
        #[arg(long)]
        all_users: bool,
        /// Only exceptions about this timesheet.
        #[arg(long, conflicts_with = "entry")]
        timesheet: Option<TimesheetId>,
        /// Only exceptions about this entry.
        #[arg(long)]
        entry: Option<TimeEntryId>,
    },
    /// Mark an exception resolved.
    Resolve {
        id: ExceptionId,
        #[arg(long)]
        note: String,
    },
    /// Dismiss an exception as acceptable.
    Dismiss {
        id: ExceptionId,
        #[arg(long)]
        note: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExceptionStatusArg {
    Open,
    Resolved,
    Dismissed,
}

impl From<ExceptionStatusArg> for ExceptionStatus {
    fn from(arg: ExceptionStatusArg) -> Self {
        match arg {
            ExceptionStatusArg::Open => Self::Open,
            ExceptionStatusArg::Resolved => Self::Resolved,
            ExceptionStatusArg::Dismissed => Self::Dismissed,
        }
    }
}
