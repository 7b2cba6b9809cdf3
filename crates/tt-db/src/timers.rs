//! Timer control and idle tracking.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use tt_core::entry::record_from_timer;
use tt_core::idle::{self, IdleCheck};
use tt_core::policy::validate_references;
use tt_core::{IdlePeriod, IdleReason, PauseReason, StartTimer, Timer, TimerId, TimerStatus, UserId};

use crate::codec::{
    format_opt_decimal, format_opt_timestamp, format_timestamp, json_list, opt_parsed,
    opt_timestamp, parsed, timestamp, to_json,
};
use crate::entries::persist_new_entry;
use crate::exceptions::raise_findings;
use crate::{Database, DbError, StopOutcome, conflict_on_constraint, ensure_written, immediate};

/// Selects a timer by id or as the user's live timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRef<'a> {
    Id(&'a TimerId),
    ActiveFor(&'a UserId),
}

const TIMER_COLUMNS: &str = "
    id, user_id, workspace_id, project_id, task_id, description, billable, hourly_rate,
    started_at, ended_at, status, paused_at, pause_reason, pauses,
    idle_threshold_minutes, last_activity_at, last_transition_at, version
";

fn timer_from_row(row: &Row<'_>) -> rusqlite::Result<Timer> {
    Ok(Timer {
        id: parsed(row, 0)?,
        user: parsed(row, 1)?,
        workspace: parsed(row, 2)?,
        project: opt_parsed(row, 3)?,
        task: opt_parsed(row, 4)?,
        description: row.get(5)?,
        billable: row.get(6)?,
        hourly_rate: opt_parsed(row, 7)?,
        started_at: timestamp(row, 8)?,
        ended_at: opt_timestamp(row, 9)?,
        status: parsed(row, 10)?,
        paused_at: opt_timestamp(row, 11)?,
        pause_reason: opt_parsed(row, 12)?,
        pauses: json_list(row, 13)?,
        idle_threshold_minutes: row.get(14)?,
        last_activity_at: timestamp(row, 15)?,
        last_transition_at: timestamp(row, 16)?,
        version: row.get(17)?,
    })
}

fn find_timer(conn: &Connection, id: &TimerId) -> Result<Option<Timer>, DbError> {
    let sql = format!("SELECT {TIMER_COLUMNS} FROM timers WHERE id = ?");
    Ok(conn
        .query_row(&sql, [id.as_str()], timer_from_row)
        .optional()?)
}

fn live_timer(conn: &Connection, user: &UserId) -> Result<Option<Timer>, DbError> {
    let sql = format!("SELECT {TIMER_COLUMNS} FROM timers WHERE user_id = ? AND status != 'stopped'");
    Ok(conn
        .query_row(&sql, [user.as_str()], timer_from_row)
        .optional()?)
}

fn load_timer(conn: &Connection, target: TimerRef<'_>) -> Result<Timer, DbError> {
    let found = match target {
        TimerRef::Id(id) => find_timer(conn, id)?,
        TimerRef::ActiveFor(user) => live_timer(conn, user)?,
    };
    found.ok_or_else(|| {
        match target {
            TimerRef::Id(id) => tt_core::Error::not_found("timer", id),
            TimerRef::ActiveFor(user) => tt_core::Error::not_found("active timer for user", user),
        }
        .into()
    })
}

fn insert_timer(conn: &Connection, timer: &Timer) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO timers ({TIMER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    conn.execute(
        &sql,
        params![
            timer.id.as_str(),
            timer.user.as_str(),
            timer.workspace.as_str(),
            timer.project.as_ref().map(|p| p.as_str()),
            timer.task.as_ref().map(|t| t.as_str()),
            timer.description,
            timer.billable,
            format_opt_decimal(timer.hourly_rate),
            format_timestamp(timer.started_at),
            format_opt_timestamp(timer.ended_at),
            timer.status.as_str(),
            format_opt_timestamp(timer.paused_at),
            timer.pause_reason.map(|r| r.as_str()),
            to_json(&timer.pauses)?,
            timer.idle_threshold_minutes,
            format_timestamp(timer.last_activity_at),
            format_timestamp(timer.last_transition_at),
            timer.version,
        ],
    )
    .map_err(|err| {
        conflict_on_constraint(err, || format!("user {} already has a live timer", timer.user))
    })?;
    Ok(())
}

/// Writes the mutable state of `timer` if its version is still current.
fn update_timer(conn: &Connection, timer: &mut Timer) -> Result<(), DbError> {
    let changed = conn.execute(
        "
        UPDATE timers SET
            ended_at = ?, status = ?, paused_at = ?, pause_reason = ?, pauses = ?,
            last_activity_at = ?, last_transition_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        ",
        params![
            format_opt_timestamp(timer.ended_at),
            timer.status.as_str(),
            format_opt_timestamp(timer.paused_at),
            timer.pause_reason.map(|r| r.as_str()),
            to_json(&timer.pauses)?,
            format_timestamp(timer.last_activity_at),
            format_timestamp(timer.last_transition_at),
            timer.id.as_str(),
            timer.version,
        ],
    )?;
    ensure_written(changed, "timer", timer.id.as_str())?;
    timer.version += 1;
    Ok(())
}

fn idle_from_row(row: &Row<'_>) -> rusqlite::Result<IdlePeriod> {
    Ok(IdlePeriod {
        id: parsed(row, 0)?,
        timer: opt_parsed(row, 1)?,
        user: parsed(row, 2)?,
        started_at: timestamp(row, 3)?,
        ended_at: opt_timestamp(row, 4)?,
        reason: parsed(row, 5)?,
    })
}

fn load_idle_periods(conn: &Connection, timer: &TimerId) -> Result<Vec<IdlePeriod>, DbError> {
    let mut stmt = conn.prepare(
        "
        SELECT id, timer_id, user_id, started_at, ended_at, reason
        FROM idle_periods
        WHERE timer_id = ?
        ORDER BY started_at ASC, id ASC
        ",
    )?;
    let rows = stmt.query_map([timer.as_str()], idle_from_row)?;
    let mut periods = Vec::new();
    for row in rows {
        periods.push(row?);
    }
    Ok(periods)
}

fn insert_idle_period(conn: &Connection, period: &IdlePeriod) -> Result<(), DbError> {
    conn.execute(
        "
        INSERT INTO idle_periods (id, timer_id, user_id, started_at, ended_at, reason)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
        params![
            period.id.as_str(),
            period.timer.as_ref().map(|t| t.as_str()),
            period.user.as_str(),
            format_timestamp(period.started_at),
            format_opt_timestamp(period.ended_at),
            period.reason.as_str(),
        ],
    )?;
    Ok(())
}

fn close_open_idle(conn: &Connection, timer: &TimerId, at: DateTime<Utc>) -> Result<(), DbError> {
    for mut period in load_idle_periods(conn, timer)?
        .into_iter()
        .filter(IdlePeriod::is_open)
    {
        period.close(at);
        conn.execute(
            "UPDATE idle_periods SET ended_at = ? WHERE id = ?",
            params![format_opt_timestamp(period.ended_at), period.id.as_str()],
        )?;
        debug!(timer = %timer, idle = %period.id, "closed idle period");
    }
    Ok(())
}

impl Database {
    /// Starts a timer. Fails with a conflict if the user already has one.
    ///
    /// Without an explicit rate the catalog's canonical rate applies.
    pub fn start_timer(&mut self, mut request: StartTimer) -> Result<Timer, DbError> {
        validate_references(
            self.catalog.as_ref(),
            &request.workspace,
            request.project.as_ref(),
            request.task.as_ref(),
        )?;
        if request.hourly_rate.is_none() {
            request.hourly_rate = self
                .catalog
                .canonical_rate(request.project.as_ref(), request.task.as_ref());
        }
        let policy = self.policies.for_workspace(&request.workspace);
        let timer = Timer::start(request, policy.idle_threshold_minutes)?;

        let tx = immediate(&mut self.conn)?;
        if let Some(live) = live_timer(&tx, &timer.user)? {
            return Err(tt_core::Error::conflict(format!(
                "user {} already has a live timer {}",
                timer.user, live.id
            ))
            .into());
        }
        insert_timer(&tx, &timer)?;
        tx.commit()?;
        info!(timer = %timer.id, user = %timer.user, "timer started");
        Ok(timer)
    }

    pub fn pause_timer(&mut self, target: TimerRef<'_>, at: DateTime<Utc>) -> Result<Timer, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timer = load_timer(&tx, target)?;
        timer.pause(at)?;
        update_timer(&tx, &mut timer)?;
        tx.commit()?;
        Ok(timer)
    }

    /// Resumes a paused timer, closing the idle period of an idle pause.
    pub fn resume_timer(&mut self, target: TimerRef<'_>, at: DateTime<Utc>) -> Result<Timer, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timer = load_timer(&tx, target)?;
        if timer.resume(at)? == PauseReason::Idle {
            close_open_idle(&tx, &timer.id, at)?;
        }
        update_timer(&tx, &mut timer)?;
        tx.commit()?;
        Ok(timer)
    }

    /// Stops a timer and records its entry in the same transaction.
    pub fn stop_timer(&mut self, target: TimerRef<'_>, at: DateTime<Utc>) -> Result<StopOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timer = load_timer(&tx, target)?;
        let policy = self.policies.for_workspace(&timer.workspace);

        timer.stop(at)?;
        close_open_idle(&tx, &timer.id, at)?;
        let idle = load_idle_periods(&tx, &timer.id)?;
        let (entry, mut findings) = record_from_timer(&timer, &idle, policy, at)?;

        update_timer(&tx, &mut timer)?;
        findings.extend(persist_new_entry(&tx, &entry, false, true)?);
        let exceptions = raise_findings(&tx, findings, at)?;
        tx.commit()?;

        info!(
            timer = %timer.id,
            entry = %entry.id,
            minutes = entry.duration_minutes,
            exceptions = exceptions.len(),
            "timer stopped"
        );
        Ok(StopOutcome {
            timer,
            entry,
            exceptions,
        })
    }

    /// Records activity; a gap over the idle threshold auto-pauses the timer.
    pub fn observe_activity(
        &mut self,
        target: TimerRef<'_>,
        at: DateTime<Utc>,
    ) -> Result<(Timer, Option<IdlePeriod>), DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut timer = load_timer(&tx, target)?;
        let period = idle::observe_activity(&mut timer, at)?;
        if let Some(period) = &period {
            insert_idle_period(&tx, period)?;
            info!(timer = %timer.id, since = %period.started_at, "idle detected");
        }
        update_timer(&tx, &mut timer)?;
        tx.commit()?;
        Ok((timer, period))
    }

    /// Stores a closed idle span reported by the client.
    pub fn record_idle(
        &mut self,
        target: TimerRef<'_>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: IdleReason,
    ) -> Result<IdlePeriod, DbError> {
        let tx = immediate(&mut self.conn)?;
        let timer = load_timer(&tx, target)?;
        let existing = load_idle_periods(&tx, &timer.id)?;
        let period = IdlePeriod::recorded(&timer, started_at, ended_at, reason, &existing)?;
        insert_idle_period(&tx, &period)?;
        tx.commit()?;
        debug!(timer = %timer.id, idle = %period.id, "recorded idle span");
        Ok(period)
    }

    /// Auto-pauses every running timer idle at `now`. Returns the paused timers.
    pub fn sweep_idle(&mut self, now: DateTime<Utc>) -> Result<Vec<Timer>, DbError> {
        let tx = immediate(&mut self.conn)?;
        let running = {
            let sql = format!("SELECT {TIMER_COLUMNS} FROM timers WHERE status = ? ORDER BY id");
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map([TimerStatus::Running.as_str()], timer_from_row)?;
            let mut timers = Vec::new();
            for row in rows {
                timers.push(row?);
            }
            timers
        };

        let mut paused = Vec::new();
        for mut timer in running {
            if let Some(period) = idle::sweep_timer(&mut timer, now)? {
                insert_idle_period(&tx, &period)?;
                update_timer(&tx, &mut timer)?;
                paused.push(timer);
            }
        }
        tx.commit()?;
        if !paused.is_empty() {
            info!(count = paused.len(), "idle sweep paused timers");
        }
        Ok(paused)
    }

    /// Classifies the timer's inactivity at `now` without writing.
    pub fn check_idle(&self, target: TimerRef<'_>, now: DateTime<Utc>) -> Result<IdleCheck, DbError> {
        let timer = load_timer(&self.conn, target)?;
        Ok(idle::check_idle(&timer, now))
    }

    pub fn timer(&self, target: TimerRef<'_>) -> Result<Timer, DbError> {
        load_timer(&self.conn, target)
    }

    pub fn active_timer(&self, user: &UserId) -> Result<Option<Timer>, DbError> {
        live_timer(&self.conn, user)
    }

    pub fn idle_periods(&self, timer: &TimerId) -> Result<Vec<IdlePeriod>, DbError> {
        load_idle_periods(&self.conn, timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Barrier};
    use tt_core::{ExceptionKind, Provenance, WorkspaceId};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, h, m, 0).unwrap()
    }

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn start_request(when: DateTime<Utc>) -> StartTimer {
        StartTimer {
            user: alice(),
            workspace: WorkspaceId::new("acme").unwrap(),
            project: None,
            task: None,
            description: Some("reviews".to_string()),
            billable: true,
            hourly_rate: Some(rust_decimal::Decimal::from(100)),
            at: when,
        }
    }

    #[test]
    fn second_live_timer_conflicts() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        db.start_timer(start_request(at(9, 0))).unwrap();
        let err = db.start_timer(start_request(at(9, 5))).unwrap_err();
        assert!(err.is_retryable());

        db.stop_timer(TimerRef::ActiveFor(&alice()), at(10, 0)).unwrap();
        assert!(db.start_timer(start_request(at(10, 5))).is_ok());
    }

    #[test]
    fn idle_scenario_records_110_minutes() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let timer = db.start_timer(start_request(at(9, 0))).unwrap();
        let target = TimerRef::Id(&timer.id);
        for minute in (5..=30).step_by(5) {
            let (_, idle) = db.observe_activity(target, at(9, minute)).unwrap();
            assert!(idle.is_none());
        }
        let (paused, idle) = db.observe_activity(target, at(9, 40)).unwrap();
        assert_eq!(paused.status, TimerStatus::Paused);
        assert!(idle.is_some());
        db.resume_timer(target, at(9, 40)).unwrap();

        let outcome = db.stop_timer(target, at(11, 0)).unwrap();
        assert_eq!(outcome.entry.duration_minutes, 110);
        assert_eq!(outcome.entry.provenance, Provenance::Timer);
        assert_eq!(outcome.entry.cost, rust_decimal::Decimal::new(18333, 2));
        assert!(outcome.exceptions.is_empty());

        let periods = db.idle_periods(&timer.id).unwrap();
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].duration_minutes(), Some(10));
    }

    #[test]
    fn stop_while_idle_paused_closes_period() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let timer = db.start_timer(start_request(at(9, 0))).unwrap();
        let paused = db.sweep_idle(at(9, 30)).unwrap();
        assert_eq!(paused.len(), 1);
        assert!(matches!(
            db.check_idle(TimerRef::Id(&timer.id), at(9, 31)).unwrap(),
            IdleCheck::NotRunning
        ));

        let outcome = db.stop_timer(TimerRef::Id(&timer.id), at(10, 0)).unwrap();
        // Idle since the last activity at 09:00.
        assert_eq!(outcome.entry.duration_minutes, 0);
        let periods = db.idle_periods(&timer.id).unwrap();
        assert!(periods.iter().all(|p| !p.is_open()));
    }

    #[test]
    fn recorded_idle_is_subtracted() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let timer = db.start_timer(start_request(at(9, 0))).unwrap();
        db.record_idle(TimerRef::Id(&timer.id), at(9, 10), at(9, 25), IdleReason::Lock)
            .unwrap();
        let outcome = db.stop_timer(TimerRef::Id(&timer.id), at(9, 30)).unwrap();
        assert_eq!(outcome.entry.duration_minutes, 15);
    }

    #[test]
    fn screen_lock_during_manual_pause_counts_once() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let timer = db.start_timer(start_request(at(9, 0))).unwrap();
        let target = TimerRef::Id(&timer.id);
        db.pause_timer(target, at(9, 10)).unwrap();
        db.record_idle(target, at(9, 15), at(9, 45), IdleReason::Lock)
            .unwrap();
        let resumed = db.resume_timer(target, at(9, 50)).unwrap();
        assert_eq!(resumed.pauses.len(), 1);

        let outcome = db.stop_timer(target, at(10, 0)).unwrap();
        assert_eq!(outcome.entry.duration_minutes, 20);
        assert!(outcome.exceptions.is_empty());
    }

    #[test]
    fn skewed_stop_raises_policy_violation() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let timer = db.start_timer(start_request(at(9, 0))).unwrap();
        let outcome = db.stop_timer(TimerRef::Id(&timer.id), at(8, 0)).unwrap();
        assert_eq!(outcome.entry.duration_minutes, 0);
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].kind, ExceptionKind::PolicyViolation);
    }

    #[test]
    fn stop_wins_over_later_pause() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let timer = db.start_timer(start_request(at(9, 0))).unwrap();
        db.stop_timer(TimerRef::Id(&timer.id), at(10, 0)).unwrap();
        let err = db.pause_timer(TimerRef::Id(&timer.id), at(10, 1)).unwrap_err();
        assert!(matches!(
            err.domain(),
            Some(tt_core::Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn missing_timer_is_not_found() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let err = db.pause_timer(TimerRef::ActiveFor(&alice()), at(9, 0)).unwrap_err();
        assert!(matches!(err.domain(), Some(tt_core::Error::NotFound { .. })));
    }

    #[test]
    fn concurrent_starts_admit_exactly_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tt.db");
        Database::open(&path).expect("create db");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut db = Database::open(&path).expect("open db");
                    barrier.wait();
                    db.start_timer(start_request(at(9, i)))
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.iter().find_map(|r| r.as_ref().err()).expect("one loser");
        assert!(loser.is_retryable());
    }
}
