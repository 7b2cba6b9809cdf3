//! Storage layer and transactional operations for the time tracker.
//!
//! Every mutating operation runs inside a single `IMMEDIATE` transaction: the
//! current state is read, `tt-core` decides the transition, and the result is
//! written before commit. Either the transition and all of its side effects
//! (entry creation, totals recompute, exceptions) land, or none do.
//!
//! # Concurrency
//!
//! [`Database`] wraps one `rusqlite::Connection`, which is `Send` but not
//! `Sync`. Concurrent workers open one `Database` each on the same file.
//! `IMMEDIATE` transactions take the write lock up front, so two writers are
//! serialized by SQLite and the second one reads the first one's result:
//!
//! - a second `start_timer` for the same user sees the live timer and fails
//!   with a conflict; the partial unique index `idx_timers_one_live` backs
//!   this up at the storage level
//! - a second decision on the same final step sees the resolved timesheet and
//!   fails with a conflict
//!
//! Rows that can be raced carry a `version` column and are written with
//! `UPDATE ... WHERE version = ?`; a write that matches no row is a conflict.
//! Conflicts are never retried here, callers retry with fresh state.
//!
//! # Schema
//!
//! Timestamps are stored as RFC 3339 TEXT in UTC, decimals as TEXT, and list
//! columns (tags, related entries) as JSON arrays.

mod approvals;
mod codec;
mod entries;
mod exceptions;
mod timers;
mod timesheets;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use thiserror::Error;
use tt_core::{
    Catalog, Exception, Policies, StaticCatalog, TimeEntry, Timer, Timesheet, WorkspaceId,
    WorkspacePolicy,
};

pub use approvals::{Escalation, EscalationKind};
pub use entries::EntryFilter;
pub use exceptions::{ExceptionFilter, ScanOutcome, ScanScope};
pub use timers::TimerRef;
pub use timesheets::TimesheetFilter;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
    /// A domain rule refused the operation.
    #[error(transparent)]
    Domain(#[from] tt_core::Error),
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        // Lock contention that outlived the busy timeout is a lost race.
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::Domain(tt_core::Error::conflict(format!("database is busy: {err}")))
            }
            _ => Self::Sqlite(err),
        }
    }
}

impl From<tt_core::ValidationError> for DbError {
    fn from(err: tt_core::ValidationError) -> Self {
        Self::Domain(err.into())
    }
}

impl DbError {
    /// The domain error, when the failure was a rule rather than storage.
    #[must_use]
    pub const fn domain(&self) -> Option<&tt_core::Error> {
        match self {
            Self::Domain(err) => Some(err),
            Self::Sqlite(_) => None,
        }
    }

    /// Whether retrying with fresh state may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.domain().is_some_and(tt_core::Error::is_retryable)
    }
}

/// Result of stopping a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub timer: Timer,
    pub entry: TimeEntry,
    /// Exceptions raised by this stop.
    pub exceptions: Vec<Exception>,
}

/// Result of creating an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub entry: TimeEntry,
    pub exceptions: Vec<Exception>,
}

/// Result of a timesheet operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimesheetOutcome {
    pub timesheet: Timesheet,
    /// Exceptions newly raised by the operation.
    pub exceptions: Vec<Exception>,
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for concurrency considerations.
pub struct Database {
    conn: Connection,
    policies: Policies,
    catalog: Arc<dyn Catalog>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self {
            conn,
            policies: Policies::default(),
            catalog: Arc::new(StaticCatalog::default()),
        };
        db.init()?;
        Ok(db)
    }

    /// Replaces the workspace policies after validating them.
    pub fn with_policies(mut self, policies: Policies) -> Result<Self, DbError> {
        policies.validate()?;
        self.policies = policies;
        Ok(self)
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn policy(&self, workspace: &WorkspaceId) -> &WorkspacePolicy {
        self.policies.for_workspace(workspace)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS timers (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                project_id TEXT,
                task_id TEXT,
                description TEXT,
                billable INTEGER NOT NULL,
                hourly_rate TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL,
                paused_at TEXT,
                pause_reason TEXT,
                pauses TEXT NOT NULL DEFAULT '[]',
                idle_threshold_minutes INTEGER NOT NULL,
                last_activity_at TEXT NOT NULL,
                last_transition_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            -- At most one live timer per user.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_timers_one_live
                ON timers(user_id) WHERE status != 'stopped';
            CREATE INDEX IF NOT EXISTS idx_timers_status ON timers(status);

            CREATE TABLE IF NOT EXISTS idle_periods (
                id TEXT PRIMARY KEY,
                timer_id TEXT,
                user_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                reason TEXT NOT NULL,
                FOREIGN KEY (timer_id) REFERENCES timers(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_idle_periods_timer ON idle_periods(timer_id);

            CREATE TABLE IF NOT EXISTS time_entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                project_id TEXT,
                task_id TEXT,
                description TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                billable INTEGER NOT NULL,
                hourly_rate TEXT,
                cost TEXT NOT NULL,
                status TEXT NOT NULL,
                provenance TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                timer_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (timer_id) REFERENCES timers(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_time_entries_owner
                ON time_entries(user_id, workspace_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_time_entries_workspace
                ON time_entries(workspace_id, started_at);

            -- period_start/period_end: inclusive UTC dates (YYYY-MM-DD)
            CREATE TABLE IF NOT EXISTS timesheets (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                status TEXT NOT NULL,
                total_hours TEXT NOT NULL,
                billable_hours TEXT NOT NULL,
                overtime_hours TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                approved_hours TEXT,
                round INTEGER NOT NULL DEFAULT 0,
                submitted_at TEXT,
                submitted_by TEXT,
                approved_at TEXT,
                approved_by TEXT,
                locked_at TEXT,
                locked_by TEXT,
                needs_recompute INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_timesheets_period
                ON timesheets(user_id, workspace_id, period_start);
            CREATE INDEX IF NOT EXISTS idx_timesheets_status ON timesheets(status);

            CREATE TABLE IF NOT EXISTS timesheet_entries (
                id TEXT PRIMARY KEY,
                timesheet_id TEXT NOT NULL,
                entry_date TEXT NOT NULL,
                project_id TEXT,
                task_id TEXT,
                description TEXT,
                minutes INTEGER NOT NULL,
                billable_minutes INTEGER NOT NULL,
                cost TEXT NOT NULL,
                override_hours TEXT,
                override_rate TEXT,
                notes TEXT,
                FOREIGN KEY (timesheet_id) REFERENCES timesheets(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_timesheet_entries_timesheet
                ON timesheet_entries(timesheet_id);

            CREATE TABLE IF NOT EXISTS timesheet_entry_links (
                timesheet_entry_id TEXT NOT NULL,
                time_entry_id TEXT NOT NULL,
                PRIMARY KEY (timesheet_entry_id, time_entry_id),
                FOREIGN KEY (timesheet_entry_id) REFERENCES timesheet_entries(id) ON DELETE CASCADE,
                FOREIGN KEY (time_entry_id) REFERENCES time_entries(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_timesheet_entry_links_entry
                ON timesheet_entry_links(time_entry_id);

            CREATE TABLE IF NOT EXISTS approval_records (
                id TEXT PRIMARY KEY,
                timesheet_id TEXT NOT NULL,
                round INTEGER NOT NULL,
                step INTEGER NOT NULL,
                approver TEXT NOT NULL,
                escalated_from TEXT,
                decision TEXT NOT NULL,
                decided_by TEXT,
                comments TEXT,
                approved_hours TEXT,
                opened_at TEXT,
                decided_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                UNIQUE (timesheet_id, round, step),
                FOREIGN KEY (timesheet_id) REFERENCES timesheets(id) ON DELETE CASCADE
            );

            -- fingerprint: identity of the anomaly across scans
            CREATE TABLE IF NOT EXISTS exceptions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                subject_type TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                related TEXT NOT NULL DEFAULT '[]',
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                entry_date TEXT,
                message TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                reviewed_by TEXT,
                reviewed_at TEXT,
                note TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_exceptions_status ON exceptions(status);
            CREATE INDEX IF NOT EXISTS idx_exceptions_subject
                ON exceptions(subject_type, subject_id);
            ",
        )?;
        Ok(())
    }
}

/// Starts a transaction that holds the write lock from its first statement.
fn immediate(conn: &mut Connection) -> Result<Transaction<'_>, DbError> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Maps a uniqueness violation to a conflict, passing other errors through.
fn conflict_on_constraint(err: rusqlite::Error, message: impl FnOnce() -> String) -> DbError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => tt_core::Error::conflict(message()).into(),
        _ => err.into(),
    }
}

/// Maps a version-checked write that touched no row to a conflict.
fn ensure_written(changed: usize, entity: &str, id: &str) -> Result<(), DbError> {
    if changed == 0 {
        return Err(tt_core::Error::conflict(format!(
            "{entity} {id} was modified concurrently"
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_has_concurrency_guards() {
        let db = Database::open_in_memory().expect("open in-memory db");

        let timer_indexes = index_names(&db.conn, "timers");
        assert!(timer_indexes.contains("idx_timers_one_live"));
        let timesheet_indexes = index_names(&db.conn, "timesheets");
        assert!(timesheet_indexes.contains("idx_timesheets_period"));

        for table in ["timers", "time_entries", "timesheets", "approval_records"] {
            let columns = table_columns(&db.conn, table);
            assert!(columns.contains(&"version".to_string()), "{table} has no version");
        }
        assert!(table_columns(&db.conn, "timesheets").contains(&"needs_recompute".to_string()));
    }

    #[test]
    fn init_is_idempotent() {
        let db = Database::open_in_memory().expect("open in-memory db");
        db.init().expect("second init");
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let mut policies = Policies::default();
        policies.default.max_entry_minutes = 0;
        let err = Database::open_in_memory()
            .expect("open in-memory db")
            .with_policies(policies)
            .err()
            .expect("invalid policy");
        assert!(matches!(
            err.domain(),
            Some(tt_core::Error::Validation(_))
        ));
    }

    #[test]
    fn busy_errors_are_retryable_conflicts() {
        let err = DbError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_retryable());
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }
}
