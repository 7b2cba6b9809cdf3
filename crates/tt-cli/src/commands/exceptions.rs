//! Exception commands: scanning for anomalies and reviewing them.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tt_core::{Exception, ExceptionId, ExceptionStatus, Period, Subject, TimesheetId, WorkspaceId};
use tt_db::{ExceptionFilter, ScanScope};

use crate::commands::util::{format_instant, write_json};
use crate::session::Session;

/// What `tt exceptions scan` covers.
#[derive(Debug, Clone)]
pub enum ScanTarget {
    Timesheet(TimesheetId),
    /// The acting user's entries, or every user's with `all_users`.
    Workspace {
        workspace: WorkspaceId,
        period: Period,
        all_users: bool,
    },
}

pub fn scan<W: Write>(writer: &mut W, session: &mut Session, target: ScanTarget, now: DateTime<Utc>) -> Result<()> {
    let scope = match target {
        ScanTarget::Timesheet(id) => ScanScope::Timesheet(id),
        ScanTarget::Workspace {
            workspace,
            period,
            all_users: true,
        } => ScanScope::Workspace {
            workspace,
            from: period.start_instant(),
            to: period.end_instant_exclusive(),
        },
        ScanTarget::Workspace {
            workspace,
            period,
            all_users: false,
        } => ScanScope::Entries {
            user: session.user()?.clone(),
            workspace,
            from: period.start_instant(),
            to: period.end_instant_exclusive(),
        },
    };
    let outcome = session.db.scan(&scope, now)?;

    if session.json {
        return write_json(writer, &outcome);
    }
    if outcome.exceptions.is_empty() {
        writeln!(writer, "No exceptions found.")?;
        return Ok(());
    }
    writeln!(
        writer,
        "{} exception(s), {} new:",
        outcome.exceptions.len(),
        outcome.raised.len()
    )?;
    for exception in &outcome.exceptions {
        write_row(writer, exception)?;
    }
    Ok(())
}

/// Filters of `tt exceptions list`.
#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    pub status: Option<ExceptionStatus>,
    pub subject: Option<Subject>,
    pub all_users: bool,
}

pub fn list<W: Write>(writer: &mut W, session: &Session, args: ListArgs) -> Result<()> {
    let user = if args.all_users {
        None
    } else {
        Some(session.user()?.clone())
    };
    let exceptions = session.db.exceptions(&ExceptionFilter {
        status: args.status,
        subject: args.subject,
        user,
        workspace: None,
    })?;

    if session.json {
        return write_json(writer, &exceptions);
    }
    if exceptions.is_empty() {
        writeln!(writer, "No exceptions.")?;
        return Ok(());
    }
    for exception in &exceptions {
        write_row(writer, exception)?;
    }
    Ok(())
}

pub fn resolve<W: Write>(
    writer: &mut W,
    session: &mut Session,
    id: &ExceptionId,
    note: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let reviewer = session.user()?.clone();
    let exception = session.db.resolve_exception(id, &reviewer, note, now)?;
    write_review(writer, session.json, &exception)
}

pub fn dismiss<W: Write>(
    writer: &mut W,
    session: &mut Session,
    id: &ExceptionId,
    note: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let reviewer = session.user()?.clone();
    let exception = session.db.dismiss_exception(id, &reviewer, note, now)?;
    write_review(writer, session.json, &exception)
}

fn write_review<W: Write>(writer: &mut W, json: bool, exception: &Exception) -> Result<()> {
    if json {
        return write_json(writer, exception);
    }
    writeln!(writer, "Exception {} {}", exception.id, exception.status)?;
    Ok(())
}

fn write_row<W: Write>(writer: &mut W, exception: &Exception) -> Result<()> {
    writeln!(
        writer,
        "{}  [{}] {}  {}  {}: {}",
        exception.id,
        exception.severity,
        exception.kind,
        exception.user,
        exception.status,
        exception.message
    )?;
    if let (Some(by), Some(at)) = (&exception.reviewed_by, exception.reviewed_at) {
        write!(writer, "    reviewed by {by} at {}", format_instant(at))?;
        match &exception.note {
            Some(note) => writeln!(writer, ": {note}")?,
            None => writeln!(writer)?,
        }
    }
    Ok(())
}
