//! Idle detection.
//!
//! Gaps in user activity are classified against the timer's threshold. The
//! detector is poll based: [`check_idle`] is a pure query, [`sweep_timer`] and
//! [`observe_activity`] apply its verdict to a timer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, ValidationError};
use crate::timer::Timer;
use crate::types::{IdlePeriodId, IdleReason, TimerId, TimerStatus, UserId};

/// A span of inactivity during a timer's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdlePeriod {
    pub id: IdlePeriodId,
    pub timer: Option<TimerId>,
    pub user: UserId,
    pub started_at: DateTime<Utc>,
    /// `None` while the user is still away.
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: IdleReason,
}

impl IdlePeriod {
    /// Opens an idle period for `timer` starting at `started_at`.
    pub fn open(timer: &Timer, started_at: DateTime<Utc>, reason: IdleReason) -> Self {
        Self {
            id: IdlePeriodId::generate(),
            timer: Some(timer.id.clone()),
            user: timer.user.clone(),
            started_at,
            ended_at: None,
            reason,
        }
    }

    /// Builds a closed idle span reported by the client.
    ///
    /// The span must lie inside the timer's life and must not overlap any idle
    /// period already stored for it.
    pub fn recorded(
        timer: &Timer,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        reason: IdleReason,
        existing: &[Self],
    ) -> Result<Self> {
        if timer.status == TimerStatus::Stopped {
            return Err(Error::invalid_transition("timer", "record idle on", timer.status));
        }
        if ended_at <= started_at {
            return Err(ValidationError::IntervalNotIncreasing {
                start: started_at,
                end: ended_at,
            }
            .into());
        }
        if started_at < timer.started_at {
            return Err(ValidationError::IdleOutsideTimer.into());
        }
        if let Some(other) = existing.iter().find(|p| p.overlaps(started_at, ended_at)) {
            return Err(ValidationError::IdleOverlap {
                existing: other.id.to_string(),
            }
            .into());
        }
        Ok(Self {
            id: IdlePeriodId::generate(),
            timer: Some(timer.id.clone()),
            user: timer.user.clone(),
            started_at,
            ended_at: Some(ended_at),
            reason,
        })
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Closes the period. An end before the start collapses the span to zero.
    pub fn close(&mut self, at: DateTime<Utc>) {
        self.ended_at = Some(at.max(self.started_at));
    }

    /// Whole minutes of a closed period.
    #[must_use]
    pub fn duration_minutes(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_minutes())
    }

    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let self_end = self.ended_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.started_at < end && start < self_end
    }
}

/// Verdict of [`check_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheck {
    /// The timer is not running, so there is nothing to detect.
    NotRunning,
    Active,
    /// The gap since the last activity exceeds the threshold.
    Idle {
        since: DateTime<Utc>,
        gap_minutes: i64,
    },
}

/// Classifies the gap between the timer's last activity and `now`.
pub fn check_idle(timer: &Timer, now: DateTime<Utc>) -> IdleCheck {
    if timer.status != TimerStatus::Running {
        return IdleCheck::NotRunning;
    }
    let gap = now - timer.last_activity_at;
    if gap > Duration::minutes(timer.idle_threshold_minutes) {
        IdleCheck::Idle {
            since: timer.last_activity_at,
            gap_minutes: gap.num_minutes(),
        }
    } else {
        IdleCheck::Active
    }
}

/// Records user activity at `at`.
///
/// When the gap since the previous observation exceeds the threshold, the
/// timer is auto-paused and the idle period covering the gap is returned.
/// Observations older than the last one are ignored.
pub fn observe_activity(timer: &mut Timer, at: DateTime<Utc>) -> Result<Option<IdlePeriod>> {
    if timer.status == TimerStatus::Stopped {
        return Err(Error::invalid_transition("timer", "observe activity on", timer.status));
    }
    if at < timer.last_activity_at {
        debug!(timer = %timer.id, %at, "ignoring out-of-order activity");
        return Ok(None);
    }
    let period = match check_idle(timer, at) {
        IdleCheck::Idle { since, gap_minutes } => {
            debug!(timer = %timer.id, %since, gap_minutes, "idle gap detected");
            timer.auto_pause(since)?;
            Some(IdlePeriod::open(timer, since, IdleReason::Inactivity))
        }
        IdleCheck::Active | IdleCheck::NotRunning => None,
    };
    timer.last_activity_at = at;
    Ok(period)
}

/// Applies [`check_idle`] to one timer without new activity.
pub fn sweep_timer(timer: &mut Timer, now: DateTime<Utc>) -> Result<Option<IdlePeriod>> {
    match check_idle(timer, now) {
        IdleCheck::Idle { since, .. } => {
            timer.auto_pause(since)?;
            Ok(Some(IdlePeriod::open(timer, since, IdleReason::Inactivity)))
        }
        IdleCheck::Active | IdleCheck::NotRunning => Ok(None),
    }
}

/// Seconds of `[window_start, window_end)` covered by the union of `periods`.
///
/// Open periods extend to `window_end`; overlapping spans are counted once.
pub fn idle_seconds_within(
    periods: &[IdlePeriod],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> i64 {
    covered_seconds(
        periods.iter().map(|p| (p.started_at, p.ended_at)),
        window_start,
        window_end,
    )
}

/// Seconds of `[window_start, window_end)` covered by the union of `spans`.
/// A span without an end runs to `window_end`.
pub fn covered_seconds(
    spans: impl IntoIterator<Item = (DateTime<Utc>, Option<DateTime<Utc>>)>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> i64 {
    let mut spans: Vec<(DateTime<Utc>, DateTime<Utc>)> = spans
        .into_iter()
        .filter_map(|(start, end)| {
            let start = start.max(window_start);
            let end = end.unwrap_or(window_end).min(window_end);
            (end > start).then_some((start, end))
        })
        .collect();
    spans.sort();

    let mut total = 0;
    let mut current: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for (start, end) in spans {
        current = match current {
            Some((cur_start, cur_end)) if start <= cur_end => Some((cur_start, cur_end.max(end))),
            Some((cur_start, cur_end)) => {
                total += (cur_end - cur_start).num_seconds();
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((start, end)) = current {
        total += (end - start).num_seconds();
    }
    total
}
