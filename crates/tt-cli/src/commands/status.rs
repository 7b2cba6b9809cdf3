//! Status command: the acting user's timer, open timesheets and exceptions.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tt_core::ExceptionStatus;
use tt_db::{ExceptionFilter, TimesheetFilter};

use crate::commands::util::{format_minutes, write_json};
use crate::session::Session;

pub fn run<W: Write>(writer: &mut W, session: &Session, now: DateTime<Utc>) -> Result<()> {
    let user = session.user()?;
    let timer = session.db.active_timer(user)?;
    let elapsed = match &timer {
        Some(timer) => Some(timer.elapsed_minutes(now, &session.db.idle_periods(&timer.id)?)),
        None => None,
    };
    let timesheets: Vec<_> = session
        .db
        .list_timesheets(&TimesheetFilter {
            user: Some(user.clone()),
            ..TimesheetFilter::default()
        })?
        .into_iter()
        .filter(|t| t.status.is_editable())
        .collect();
    let open_exceptions = session
        .db
        .exceptions(&ExceptionFilter {
            status: Some(ExceptionStatus::Open),
            user: Some(user.clone()),
            ..ExceptionFilter::default()
        })?
        .len();

    if session.json {
        return write_json(
            writer,
            &json!({
                "user": user,
                "database": session.config.database_path,
                "timer": timer,
                "elapsed_minutes": elapsed,
                "open_timesheets": timesheets,
                "open_exceptions": open_exceptions,
            }),
        );
    }

    writeln!(writer, "Time tracker status for {user}")?;
    writeln!(writer, "Database: {}", session.config.database_path.display())?;
    match (&timer, elapsed) {
        (Some(timer), Some(elapsed)) => writeln!(
            writer,
            "Timer: {} in {}, {} so far",
            timer.status,
            timer.workspace,
            format_minutes(elapsed)
        )?,
        _ => writeln!(writer, "Timer: none")?,
    }
    if timesheets.is_empty() {
        writeln!(writer, "Open timesheets: none")?;
    } else {
        writeln!(writer, "Open timesheets:")?;
        for timesheet in &timesheets {
            writeln!(
                writer,
                "- {} to {} in {}: {}, {:.2}h",
                timesheet.period.start,
                timesheet.period.end,
                timesheet.workspace,
                timesheet.status,
                timesheet.total_hours
            )?;
        }
    }
    writeln!(writer, "Open exceptions: {open_exceptions}")?;
    Ok(())
}
