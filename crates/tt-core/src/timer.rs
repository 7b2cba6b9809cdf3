//! Timer state machine.
//!
//! ```text
//!   start ──► running ──pause──► paused ──resume──► running
//!                │                  │
//!                └──────stop────────┴──────► stopped
//! ```
//!
//! Every transition carries the instant of the request. Transitions older
//! than the last one applied are stale and fail with [`Error::Conflict`];
//! `stop` is the exception and is always accepted from a live timer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::idle::{IdlePeriod, covered_seconds};
use crate::money::ensure_amount;
use crate::types::{PauseReason, ProjectId, TaskId, TimerId, TimerStatus, UserId, WorkspaceId};

/// A request to start tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTimer {
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
    pub description: Option<String>,
    pub billable: bool,
    pub hourly_rate: Option<Decimal>,
    pub at: DateTime<Utc>,
}

/// A live or finished tracking session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub id: TimerId,
    pub user: UserId,
    pub workspace: WorkspaceId,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
    pub description: Option<String>,
    pub billable: bool,
    pub hourly_rate: Option<Decimal>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TimerStatus,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<PauseReason>,
    /// Settled manual pauses. Idle pauses are accounted as idle periods.
    pub pauses: Vec<PauseSpan>,
    pub idle_threshold_minutes: i64,
    pub last_activity_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub version: i64,
}

/// A manual pause between `paused_at` and the following resume or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseSpan {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Why a finalized duration was clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampReason {
    /// Clock skew made `end − start − paused − idle` negative.
    NegativeDuration { raw_minutes: i64 },
    /// The session ran past the maximum entry length.
    ExceedsMaximum { raw_minutes: i64, max_minutes: i64 },
}

/// Active time of a stopped timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTime {
    pub gross_seconds: i64,
    pub paused_seconds: i64,
    pub idle_seconds: i64,
    pub minutes: i64,
    pub clamped: Option<ClampReason>,
}

impl Timer {
    pub fn start(request: StartTimer, idle_threshold_minutes: i64) -> Result<Self> {
        if let Some(rate) = request.hourly_rate {
            ensure_amount("hourly rate", rate)?;
        }
        let description = request
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        Ok(Self {
            id: TimerId::generate(),
            user: request.user,
            workspace: request.workspace,
            project: request.project,
            task: request.task,
            description,
            billable: request.billable,
            hourly_rate: request.hourly_rate,
            started_at: request.at,
            ended_at: None,
            status: TimerStatus::Running,
            paused_at: None,
            pause_reason: None,
            pauses: Vec::new(),
            idle_threshold_minutes,
            last_activity_at: request.at,
            last_transition_at: request.at,
            version: 0,
        })
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status != TimerStatus::Stopped
    }

    fn ensure_fresh(&self, action: &str, at: DateTime<Utc>) -> Result<()> {
        if at < self.last_transition_at {
            return Err(Error::conflict(format!(
                "stale {action} at {at}: timer {} last changed at {}",
                self.id, self.last_transition_at
            )));
        }
        Ok(())
    }

    /// running → paused.
    pub fn pause(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != TimerStatus::Running {
            return Err(Error::invalid_transition("timer", "pause", self.status));
        }
        self.ensure_fresh("pause", at)?;
        self.status = TimerStatus::Paused;
        self.paused_at = Some(at);
        self.pause_reason = Some(PauseReason::Manual);
        self.last_transition_at = at;
        debug!(timer = %self.id, %at, "timer paused");
        Ok(())
    }

    /// running → paused on behalf of idle detection, backdated to `since`.
    pub(crate) fn auto_pause(&mut self, since: DateTime<Utc>) -> Result<()> {
        if self.status != TimerStatus::Running {
            return Err(Error::invalid_transition("timer", "auto-pause", self.status));
        }
        self.status = TimerStatus::Paused;
        self.paused_at = Some(since);
        self.pause_reason = Some(PauseReason::Idle);
        self.last_transition_at = self.last_transition_at.max(since);
        debug!(timer = %self.id, %since, "timer auto-paused");
        Ok(())
    }

    /// paused → running. Returns why the timer had been paused so the caller
    /// can close an open idle period.
    pub fn resume(&mut self, at: DateTime<Utc>) -> Result<PauseReason> {
        if self.status != TimerStatus::Paused {
            return Err(Error::invalid_transition("timer", "resume", self.status));
        }
        self.ensure_fresh("resume", at)?;
        let reason = self.pause_reason.unwrap_or(PauseReason::Manual);
        self.settle_pause(at);
        self.status = TimerStatus::Running;
        self.last_transition_at = at;
        self.last_activity_at = self.last_activity_at.max(at);
        debug!(timer = %self.id, %at, ?reason, "timer resumed");
        Ok(reason)
    }

    /// running | paused → stopped.
    ///
    /// A pause recorded after `at` contributes nothing.
    pub fn stop(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status == TimerStatus::Stopped {
            return Err(Error::invalid_transition("timer", "stop", self.status));
        }
        self.settle_pause(at);
        self.status = TimerStatus::Stopped;
        self.ended_at = Some(at);
        self.last_transition_at = self.last_transition_at.max(at);
        debug!(timer = %self.id, %at, "timer stopped");
        Ok(())
    }

    fn settle_pause(&mut self, at: DateTime<Utc>) {
        if let (Some(PauseReason::Manual), Some(paused_at)) = (self.pause_reason, self.paused_at) {
            if at > paused_at {
                self.pauses.push(PauseSpan {
                    started_at: paused_at,
                    ended_at: at,
                });
            }
        }
        self.paused_at = None;
        self.pause_reason = None;
    }

    /// Manual pauses including the one still open, which runs to the window end.
    fn pause_spans(&self) -> impl Iterator<Item = (DateTime<Utc>, Option<DateTime<Utc>>)> + '_ {
        let current = match (self.pause_reason, self.paused_at) {
            (Some(PauseReason::Manual), Some(paused_at)) => Some((paused_at, None)),
            _ => None,
        };
        self.pauses
            .iter()
            .map(|span| (span.started_at, Some(span.ended_at)))
            .chain(current)
    }

    /// Seconds of `[started_at, end)` spent paused and, outside those pauses,
    /// idle. A span both paused and idle counts once, as paused.
    fn away_seconds(&self, idle: &[IdlePeriod], end: DateTime<Utc>) -> (i64, i64) {
        let paused = covered_seconds(self.pause_spans(), self.started_at, end);
        let away = covered_seconds(
            self.pause_spans()
                .chain(idle.iter().map(|p| (p.started_at, p.ended_at))),
            self.started_at,
            end,
        );
        (paused, away - paused)
    }

    /// Active minutes so far, for display. Never negative.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>, idle: &[IdlePeriod]) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        let (paused, idle) = self.away_seconds(idle, end);
        ((end - self.started_at).num_seconds() - paused - idle).max(0) / 60
    }

    /// `(end − start) − paused − idle` of a stopped timer, clamped into
    /// `0..=max_minutes`.
    pub fn active_time(&self, idle: &[IdlePeriod], max_minutes: i64) -> Result<ActiveTime> {
        let Some(end) = self.ended_at else {
            return Err(Error::invalid_transition("timer", "finalize", self.status));
        };
        let gross_seconds = (end - self.started_at).num_seconds();
        let (paused_seconds, idle_seconds) = self.away_seconds(idle, end);
        let net = gross_seconds - paused_seconds - idle_seconds;
        let raw_minutes = net.div_euclid(60);

        let (minutes, clamped) = if net < 0 {
            (0, Some(ClampReason::NegativeDuration { raw_minutes }))
        } else if raw_minutes > max_minutes {
            (
                max_minutes,
                Some(ClampReason::ExceedsMaximum {
                    raw_minutes,
                    max_minutes,
                }),
            )
        } else {
            (raw_minutes, None)
        };

        Ok(ActiveTime {
            gross_seconds,
            paused_seconds,
            idle_seconds,
            minutes,
            clamped,
        })
    }
}
