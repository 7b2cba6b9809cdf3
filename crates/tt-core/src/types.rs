//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.trim().is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                Ok(Self(id))
            }

            /// Generates a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self::from_uuid(Uuid::new_v4())
            }

            /// Wraps a UUID, which is never empty.
            #[must_use]
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id.to_string())
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Generates a closed string enum with `as_str`, `Display` and `FromStr`.
macro_rules! define_str_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// String representation for database storage.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    _ => Err(ValidationError::UnknownVariant {
                        field: $field_name,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

define_string_id!(
    /// The user who owns timers, entries and timesheets.
    ///
    /// Resolved and authorized by the caller; the core treats it as opaque.
    UserId, "user ID"
);

impl UserId {
    /// The identity recorded on automatic decisions.
    #[must_use]
    pub fn system() -> Self {
        Self(String::from("system"))
    }
}

define_string_id!(
    /// The tenant every entity is scoped to.
    WorkspaceId, "workspace ID"
);

define_string_id!(ProjectId, "project ID");

define_string_id!(TaskId, "task ID");

define_string_id!(TimerId, "timer ID");

define_string_id!(IdlePeriodId, "idle period ID");

define_string_id!(TimeEntryId, "time entry ID");

define_string_id!(TimesheetId, "timesheet ID");

define_string_id!(
    /// Identifier of a `(date, project, task)` bucket inside a timesheet.
    ///
    /// Derived deterministically from the timesheet and the bucket key, so
    /// re-aggregation upserts instead of inserting duplicates.
    TimesheetEntryId, "timesheet entry ID"
);

define_string_id!(ApprovalRecordId, "approval record ID");

define_string_id!(ExceptionId, "exception ID");

define_str_enum!(
    /// Lifecycle of a timer.
    TimerStatus, "timer status" {
        Running => "running",
        Paused => "paused",
        Stopped => "stopped",
    }
);

define_str_enum!(
    /// Why a timer is paused.
    PauseReason, "pause reason" {
        /// The user paused explicitly.
        Manual => "manual",
        /// Idle detection paused the timer; the span is accounted as idle time.
        Idle => "idle",
    }
);

define_str_enum!(
    /// How an idle period was detected.
    IdleReason, "idle reason" {
        Inactivity => "inactivity",
        Lock => "lock",
        Manual => "manual",
    }
);

define_str_enum!(
    /// Approval state of a single time entry.
    EntryStatus, "entry status" {
        Draft => "draft",
        Submitted => "submitted",
        Approved => "approved",
        Rejected => "rejected",
        Locked => "locked",
    }
);

define_str_enum!(
    /// Where a time entry came from.
    Provenance, "provenance" {
        Manual => "manual",
        Timer => "timer",
        Imported => "imported",
    }
);

define_str_enum!(
    /// Approval state of a timesheet.
    TimesheetStatus, "timesheet status" {
        Draft => "draft",
        Submitted => "submitted",
        Approved => "approved",
        Rejected => "rejected",
        ChangesRequested => "changes_requested",
        Locked => "locked",
    }
);

impl TimesheetStatus {
    /// Whether the timesheet's contents may still change.
    #[must_use]
    pub const fn is_editable(&self) -> bool {
        matches!(
            self,
            Self::Draft | Self::Submitted | Self::Rejected | Self::ChangesRequested
        )
    }

    /// The status linked time entries take when the timesheet enters this status.
    #[must_use]
    pub const fn entry_status(&self) -> EntryStatus {
        match self {
            Self::Draft | Self::ChangesRequested => EntryStatus::Draft,
            Self::Submitted => EntryStatus::Submitted,
            Self::Approved => EntryStatus::Approved,
            Self::Rejected => EntryStatus::Rejected,
            Self::Locked => EntryStatus::Locked,
        }
    }
}

define_str_enum!(
    /// A decision recorded on one approval step.
    Decision, "decision" {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        ChangesRequested => "changes_requested",
    }
);

define_str_enum!(
    /// Kind of flagged anomaly.
    ExceptionKind, "exception kind" {
        Overtime => "overtime",
        MissingTime => "missing_time",
        DuplicateEntry => "duplicate_entry",
        RateMismatch => "rate_mismatch",
        PolicyViolation => "policy_violation",
    }
);

define_str_enum!(
    /// How far a finding deviates from policy.
    Severity, "severity" {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

define_str_enum!(
    /// Review state of an exception.
    ExceptionStatus, "exception status" {
        Open => "open",
        Resolved => "resolved",
        Dismissed => "dismissed",
    }
);

define_str_enum!(
    /// Workspace roles recognised by the approval workflow.
    Role, "role" {
        Owner => "owner",
        Admin => "admin",
        Manager => "manager",
        Member => "member",
    }
);

impl Role {
    const fn rank(self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Admin => 2,
            Self::Manager => 1,
            Self::Member => 0,
        }
    }

    /// Whether holders of this role may decide approval steps at all.
    #[must_use]
    pub const fn can_approve(self) -> bool {
        self.rank() >= Self::Manager.rank()
    }

    /// Whether this role satisfies a step that requires `required`.
    #[must_use]
    pub const fn satisfies(self, required: Self) -> bool {
        self.can_approve() && self.rank() >= required.rank()
    }
}

define_str_enum!(
    /// How the steps of an approval workflow are ordered.
    WorkflowKind, "workflow kind" {
        /// Step N may only be decided after step N-1 is approved.
        Sequential => "sequential",
        /// Steps may be decided in any order.
        Parallel => "parallel",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rejects_empty() {
        assert!(UserId::new("").is_err());
        assert!(UserId::new("   ").is_err());
        assert!(UserId::new("alice").is_ok());
    }

    #[test]
    fn workspace_id_serde_rejects_empty() {
        let result: Result<WorkspaceId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
        let parsed: WorkspaceId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(parsed.as_str(), "acme");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TimerId::generate(), TimerId::generate());
    }

    #[test]
    fn str_enums_parse_their_storage_form() {
        assert_eq!(
            "changes_requested".parse::<TimesheetStatus>().unwrap(),
            TimesheetStatus::ChangesRequested
        );
        assert_eq!(
            "duplicate_entry".parse::<ExceptionKind>().unwrap(),
            ExceptionKind::DuplicateEntry
        );
        assert!("approved-ish".parse::<Decision>().is_err());
        assert_eq!(TimerStatus::Paused.as_str(), "paused");
    }

    #[test]
    fn str_enums_serialize_snake_case() {
        let json = serde_json::to_string(&ExceptionKind::MissingTime).unwrap();
        assert_eq!(json, "\"missing_time\"");
    }

    #[test]
    fn role_hierarchy() {
        assert!(Role::Admin.satisfies(Role::Manager));
        assert!(Role::Manager.satisfies(Role::Manager));
        assert!(!Role::Manager.satisfies(Role::Admin));
        assert!(!Role::Member.satisfies(Role::Member));
        assert!(!Role::Member.can_approve());
    }

    #[test]
    fn timesheet_status_editability() {
        assert!(TimesheetStatus::Draft.is_editable());
        assert!(TimesheetStatus::ChangesRequested.is_editable());
        assert!(!TimesheetStatus::Approved.is_editable());
        assert!(!TimesheetStatus::Locked.is_editable());
        assert_eq!(
            TimesheetStatus::Locked.entry_status(),
            EntryStatus::Locked
        );
    }
}
