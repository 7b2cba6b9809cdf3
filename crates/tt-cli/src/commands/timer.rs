//! Timer commands: start, pause, resume, stop, and idle handling.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tt_core::{IdleCheck, IdleReason, PauseReason, ProjectId, StartTimer, TaskId, Timer, TimerStatus, WorkspaceId};
use tt_db::TimerRef;

use crate::commands::util::{format_instant, format_minutes, write_exceptions, write_json};
use crate::session::Session;

/// Fields of `tt timer start`.
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub workspace: WorkspaceId,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
    pub description: Option<String>,
    pub rate: Option<Decimal>,
    pub billable: bool,
}

pub fn start<W: Write>(writer: &mut W, session: &mut Session, args: StartArgs, at: DateTime<Utc>) -> Result<()> {
    let user = session.user()?.clone();
    let timer = session.db.start_timer(StartTimer {
        user,
        workspace: args.workspace,
        project: args.project,
        task: args.task,
        description: args.description,
        billable: args.billable,
        hourly_rate: args.rate,
        at,
    })?;

    if session.json {
        return write_json(writer, &timer);
    }
    writeln!(writer, "Started timer {}", timer.id)?;
    write_timer(writer, &timer)
}

pub fn pause<W: Write>(writer: &mut W, session: &mut Session, at: DateTime<Utc>) -> Result<()> {
    let user = session.user()?.clone();
    let timer = session.db.pause_timer(TimerRef::ActiveFor(&user), at)?;
    if session.json {
        return write_json(writer, &timer);
    }
    writeln!(writer, "Paused timer {} at {}", timer.id, format_instant(at))?;
    Ok(())
}

pub fn resume<W: Write>(writer: &mut W, session: &mut Session, at: DateTime<Utc>) -> Result<()> {
    let user = session.user()?.clone();
    let timer = session.db.resume_timer(TimerRef::ActiveFor(&user), at)?;
    if session.json {
        return write_json(writer, &timer);
    }
    writeln!(writer, "Resumed timer {} at {}", timer.id, format_instant(at))?;
    Ok(())
}

pub fn stop<W: Write>(writer: &mut W, session: &mut Session, at: DateTime<Utc>) -> Result<()> {
    let user = session.user()?.clone();
    let outcome = session.db.stop_timer(TimerRef::ActiveFor(&user), at)?;

    if session.json {
        return write_json(
            writer,
            &json!({
                "timer": outcome.timer,
                "entry": outcome.entry,
                "exceptions": outcome.exceptions,
            }),
        );
    }
    let entry = &outcome.entry;
    writeln!(writer, "Stopped timer {}", outcome.timer.id)?;
    writeln!(
        writer,
        "Recorded entry {}: {}, cost {:.2}",
        entry.id,
        format_minutes(entry.duration_minutes),
        entry.cost
    )?;
    write_exceptions(writer, &outcome.exceptions)
}

/// Shows the live timer with its elapsed time and idle verdict.
pub fn show<W: Write>(writer: &mut W, session: &mut Session, now: DateTime<Utc>) -> Result<()> {
    let user = session.user()?.clone();
    let Some(timer) = session.db.active_timer(&user)? else {
        if session.json {
            return write_json(writer, &serde_json::Value::Null);
        }
        writeln!(writer, "No running timer.")?;
        return Ok(());
    };
    let idle = session.db.idle_periods(&timer.id)?;
    let elapsed = timer.elapsed_minutes(now, &idle);
    let check = session.db.check_idle(TimerRef::Id(&timer.id), now)?;

    if session.json {
        let idle_since = match check {
            IdleCheck::Idle { since, .. } => Some(since),
            IdleCheck::NotRunning | IdleCheck::Active => None,
        };
        return write_json(
            writer,
            &json!({
                "timer": timer,
                "elapsed_minutes": elapsed,
                "idle_since": idle_since,
                "idle_periods": idle,
            }),
        );
    }
    writeln!(writer, "Timer {}", timer.id)?;
    write_timer(writer, &timer)?;
    writeln!(writer, "  elapsed: {}", format_minutes(elapsed))?;
    if let IdleCheck::Idle { since, gap_minutes } = check {
        writeln!(
            writer,
            "  idle: no activity for {} since {}",
            format_minutes(gap_minutes),
            format_instant(since)
        )?;
    }
    Ok(())
}

/// Reports user activity; prints whether idle detection paused the timer.
pub fn activity<W: Write>(writer: &mut W, session: &mut Session, at: DateTime<Utc>) -> Result<()> {
    let user = session.user()?.clone();
    let (timer, period) = session.db.observe_activity(TimerRef::ActiveFor(&user), at)?;
    if session.json {
        return write_json(writer, &json!({ "timer": timer, "idle_period": period }));
    }
    match period {
        Some(period) => writeln!(
            writer,
            "Idle since {}: timer {} paused",
            format_instant(period.started_at),
            timer.id
        )?,
        None => writeln!(writer, "Activity recorded for timer {}", timer.id)?,
    }
    Ok(())
}

/// Records a closed idle span against the live timer.
pub fn idle<W: Write>(
    writer: &mut W,
    session: &mut Session,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    reason: IdleReason,
) -> Result<()> {
    let user = session.user()?.clone();
    let period = session.db.record_idle(TimerRef::ActiveFor(&user), from, to, reason)?;
    if session.json {
        return write_json(writer, &period);
    }
    writeln!(
        writer,
        "Recorded {} idle ({}) from {} to {}",
        format_minutes(period.duration_minutes().unwrap_or(0)),
        period.reason,
        format_instant(from),
        format_instant(to)
    )?;
    Ok(())
}

/// Auto-pauses every running timer that went idle, across all users.
pub fn sweep<W: Write>(writer: &mut W, session: &mut Session, now: DateTime<Utc>) -> Result<()> {
    let paused = session.db.sweep_idle(now)?;
    if session.json {
        return write_json(writer, &paused);
    }
    if paused.is_empty() {
        writeln!(writer, "No idle timers.")?;
        return Ok(());
    }
    for timer in &paused {
        writeln!(writer, "Paused idle timer {} of {}", timer.id, timer.user)?;
    }
    Ok(())
}

fn write_timer<W: Write>(writer: &mut W, timer: &Timer) -> Result<()> {
    writeln!(writer, "  status: {}", status_label(timer))?;
    writeln!(writer, "  workspace: {}", timer.workspace)?;
    if let Some(project) = &timer.project {
        writeln!(writer, "  project: {project}")?;
    }
    if let Some(task) = &timer.task {
        writeln!(writer, "  task: {task}")?;
    }
    if let Some(description) = &timer.description {
        writeln!(writer, "  description: {description}")?;
    }
    writeln!(writer, "  started: {}", format_instant(timer.started_at))?;
    if !timer.billable {
        writeln!(writer, "  non-billable")?;
    } else if let Some(rate) = timer.hourly_rate {
        writeln!(writer, "  rate: {rate:.2}")?;
    }
    Ok(())
}

fn status_label(timer: &Timer) -> String {
    match (timer.status, timer.pause_reason, timer.paused_at) {
        (TimerStatus::Paused, Some(PauseReason::Idle), Some(since)) => {
            format!("paused (idle since {})", format_instant(since))
        }
        (TimerStatus::Paused, _, Some(since)) => format!("paused since {}", format_instant(since)),
        (status, _, _) => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use tt_core::StaticCatalog;
    use tt_db::Database;

    use crate::Config;
    use crate::commands::util::parse_datetime;

    fn session() -> Session {
        let config = Config {
            user: Some("alice".parse().unwrap()),
            catalog: StaticCatalog::default().with_project(
                "web".parse().unwrap(),
                "acme".parse().unwrap(),
                Some(Decimal::from(100)),
            ),
            ..Config::default()
        };
        Session::new(Database::open_in_memory().unwrap(), config, None, false).unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        parse_datetime(s).unwrap()
    }

    fn start_args() -> StartArgs {
        StartArgs {
            workspace: "acme".parse().unwrap(),
            project: Some("web".parse().unwrap()),
            task: None,
            description: Some("landing page".to_string()),
            rate: None,
            billable: true,
        }
    }

    fn run(session: &mut Session, f: impl FnOnce(&mut Vec<u8>, &mut Session) -> Result<()>) -> String {
        let mut output = Vec::new();
        f(&mut output, session).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn timer_lifecycle_outputs() {
        let mut session = session();
        let started = run(&mut session, |w, s| start(w, s, start_args(), at("2025-03-03T09:00:00Z")));
        let timer_id = session
            .db
            .active_timer(&"alice".parse().unwrap())
            .unwrap()
            .unwrap()
            .id;

        run(&mut session, |w, s| pause(w, s, at("2025-03-03T10:00:00Z")));
        let shown = run(&mut session, |w, s| show(w, s, at("2025-03-03T10:30:00Z")));
        run(&mut session, |w, s| resume(w, s, at("2025-03-03T10:30:00Z")));
        let stopped = run(&mut session, |w, s| stop(w, s, at("2025-03-03T11:20:00Z")));

        let entry_id = session
            .db
            .list_entries(&tt_db::EntryFilter::default())
            .unwrap()
            .remove(0)
            .id;
        let output = format!("{started}---\n{shown}---\n{stopped}")
            .replace(timer_id.as_str(), "[TIMER]")
            .replace(entry_id.as_str(), "[ENTRY]");
        assert_snapshot!(output, @r"
Started timer [TIMER]
  status: running
  workspace: acme
  project: web
  description: landing page
  started: 2025-03-03 09:00
  rate: 100.00
---
Timer [TIMER]
  status: paused since 2025-03-03 10:00
  workspace: acme
  project: web
  description: landing page
  started: 2025-03-03 09:00
  rate: 100.00
  elapsed: 1h
---
Stopped timer [TIMER]
Recorded entry [ENTRY]: 1h 50m, cost 183.33
");
    }

    #[test]
    fn activity_after_long_gap_pauses_timer() {
        let mut session = session();
        run(&mut session, |w, s| start(w, s, start_args(), at("2025-03-03T09:00:00Z")));
        let output = run(&mut session, |w, s| activity(w, s, at("2025-03-03T09:30:00Z")));
        assert!(output.starts_with("Idle since 2025-03-03 09:00: timer "), "{output}");

        let timer = session
            .db
            .active_timer(&"alice".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(timer.pause_reason, Some(PauseReason::Idle));
    }

    #[test]
    fn sweep_reports_nothing_when_all_active() {
        let mut session = session();
        run(&mut session, |w, s| start(w, s, start_args(), at("2025-03-03T09:00:00Z")));
        let output = run(&mut session, |w, s| sweep(w, s, at("2025-03-03T09:02:00Z")));
        assert_eq!(output, "No idle timers.\n");
    }

    #[test]
    fn show_without_timer() {
        let mut session = session();
        let output = run(&mut session, |w, s| show(w, s, at("2025-03-03T09:00:00Z")));
        assert_eq!(output, "No running timer.\n");
    }

    #[test]
    fn second_start_is_a_conflict() {
        let mut session = session();
        run(&mut session, |w, s| start(w, s, start_args(), at("2025-03-03T09:00:00Z")));
        let mut output = Vec::new();
        let err = start(&mut output, &mut session, start_args(), at("2025-03-03T09:05:00Z")).unwrap_err();
        let db_err = err.downcast_ref::<tt_db::DbError>().unwrap();
        assert!(db_err.is_retryable());
    }
}
