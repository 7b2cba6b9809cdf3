//! Error kinds surfaced by every core operation.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Convenience alias for core results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field-level validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// A stored or supplied string did not name a known variant.
    #[error("unknown {field}: {value}")]
    UnknownVariant { field: &'static str, value: String },

    /// A decimal amount could not be parsed or was negative.
    #[error("invalid {field}: {value}")]
    InvalidAmount { field: &'static str, value: String },

    /// The end of an interval is not after its start.
    #[error("end {end} must be after start {start}")]
    IntervalNotIncreasing {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// The duration falls outside `(0, max]` minutes.
    #[error("duration of {minutes} minutes is outside 1..={max} minutes")]
    DurationOutOfBounds { minutes: i64, max: i64 },

    /// A project or task belongs to a different workspace.
    #[error("{what} belongs to workspace {actual}, not {expected}")]
    WorkspaceMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// A task does not belong to the given project.
    #[error("task {task} belongs to project {actual}, not {expected}")]
    TaskProjectMismatch {
        task: String,
        expected: String,
        actual: String,
    },

    /// A period whose end precedes its start.
    #[error("period end {end} precedes start {start}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },

    /// The requested period overlaps an existing timesheet of the same user.
    #[error("period {start}..={end} overlaps timesheet {existing}")]
    PeriodOverlap {
        start: NaiveDate,
        end: NaiveDate,
        existing: String,
    },

    /// A timesheet with zero hours cannot be submitted.
    #[error("timesheet has no recorded hours")]
    NothingToSubmit,

    /// Reject and request-changes decisions must explain themselves.
    #[error("comments are required to {action}")]
    CommentsRequired { action: &'static str },

    /// Approved hours must lie within `0..=total_hours`.
    #[error("approved hours {approved} must be between 0 and {total}")]
    ApprovedHoursOutOfRange { approved: Decimal, total: Decimal },

    /// Resolving or dismissing an exception requires a note.
    #[error("a note is required to {action} an exception")]
    NoteRequired { action: &'static str },

    /// Strict mode refuses exact duplicate intervals.
    #[error("entry duplicates the interval of entry {existing}")]
    DuplicateEntry { existing: String },

    /// A recorded idle span overlaps one already stored for the timer.
    #[error("idle span overlaps idle period {existing}")]
    IdleOverlap { existing: String },

    /// A recorded idle span lies outside the timer's lifetime.
    #[error("idle span must lie within the timer's lifetime")]
    IdleOutsideTimer,

    /// A policy document failed boundary validation.
    #[error("invalid policy: {message}")]
    InvalidPolicy { message: String },
}

/// Domain errors, one variant per kind callers branch on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A concurrent-timer violation or a lost race on stale state. Retryable.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The requested state-machine move is not allowed from the current state.
    #[error("cannot {action} {entity} in state {state}")]
    InvalidTransition {
        entity: &'static str,
        action: &'static str,
        state: String,
    },

    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The actor may not perform the operation.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Discriminant of [`Error`] without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    InvalidTransition,
    Validation,
    PermissionDenied,
    NotFound,
}

impl Error {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        action: &'static str,
        state: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            action,
            state: state.to_string(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Validation(_) => ErrorKind::Validation,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// Conflicts are resolved by retrying with fresh state; nothing else is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(Error::conflict("timer already running").is_retryable());
        assert!(!Error::not_found("timer", "t-1").is_retryable());
        assert!(!Error::from(ValidationError::NothingToSubmit).is_retryable());
    }

    #[test]
    fn kinds_match_variants() {
        assert_eq!(
            Error::invalid_transition("timer", "pause", "stopped").kind(),
            ErrorKind::InvalidTransition
        );
        assert_eq!(
            Error::permission_denied("self approval").kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn invalid_transition_message_names_state() {
        let err = Error::invalid_transition("timesheet", "aggregate", "locked");
        assert_eq!(err.to_string(), "cannot aggregate timesheet in state locked");
    }
}
