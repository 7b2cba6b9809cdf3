//! Exception persistence and scanning.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info};
use tt_core::exception::{scan_entries, scan_timesheet, scan_workspace};
use tt_core::{
    Exception, ExceptionId, ExceptionStatus, Finding, Subject, TimesheetId, UserId, WorkspaceId,
};

use crate::codec::{
    conversion_error, format_opt_timestamp, format_timestamp, json_list, opt_parsed,
    opt_timestamp, parsed, timestamp, to_json,
};
use crate::entries::{EntryFilter, query_entries};
use crate::timesheets::{load_timesheet, recompute};
use crate::{Database, DbError, ensure_written, immediate};

/// What a scan inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    /// Every rule over the timesheet and its entries.
    Timesheet(TimesheetId),
    /// Entry rules over one user's entries starting in `[from, to)`.
    Entries {
        user: UserId,
        workspace: WorkspaceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Entry rules over every user of a workspace.
    Workspace {
        workspace: WorkspaceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Result of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    /// The stored exception of every anomaly the scope exhibits, in any
    /// status, in rule order.
    pub exceptions: Vec<Exception>,
    /// Ids of the exceptions first raised by this scan.
    pub raised: Vec<ExceptionId>,
}

impl ScanOutcome {
    #[must_use]
    pub fn is_new(&self, exception: &Exception) -> bool {
        self.raised.contains(&exception.id)
    }

    /// Exceptions first raised by this scan.
    pub fn new_exceptions(&self) -> impl Iterator<Item = &Exception> {
        self.exceptions.iter().filter(|e| self.is_new(e))
    }
}

/// Selects exceptions for listing. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionFilter {
    pub status: Option<ExceptionStatus>,
    pub subject: Option<Subject>,
    pub user: Option<UserId>,
    pub workspace: Option<WorkspaceId>,
}

const EXCEPTION_COLUMNS: &str = "
    id, kind, severity, subject_type, subject_id, related, user_id, workspace_id, entry_date,
    message, fingerprint, status, created_at, reviewed_by, reviewed_at, note
";

fn exception_from_row(row: &Row<'_>) -> rusqlite::Result<Exception> {
    let subject_type: String = row.get(3)?;
    let subject_id: String = row.get(4)?;
    let subject = Subject::parse(&subject_type, &subject_id).map_err(|err| conversion_error(3, err))?;
    Ok(Exception {
        id: parsed(row, 0)?,
        kind: parsed(row, 1)?,
        severity: parsed(row, 2)?,
        subject,
        related: json_list(row, 5)?,
        user: parsed(row, 6)?,
        workspace: parsed(row, 7)?,
        date: opt_parsed(row, 8)?,
        message: row.get(9)?,
        fingerprint: row.get(10)?,
        status: parsed(row, 11)?,
        created_at: timestamp(row, 12)?,
        reviewed_by: opt_parsed(row, 13)?,
        reviewed_at: opt_timestamp(row, 14)?,
        note: row.get(15)?,
    })
}

fn load_exception(conn: &Connection, id: &ExceptionId) -> Result<Exception, DbError> {
    let sql = format!("SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE id = ?");
    conn.query_row(&sql, [id.as_str()], exception_from_row)
        .optional()?
        .ok_or_else(|| tt_core::Error::not_found("exception", id).into())
}

fn load_by_fingerprint(conn: &Connection, fingerprint: &str) -> Result<Exception, DbError> {
    let sql = format!("SELECT {EXCEPTION_COLUMNS} FROM exceptions WHERE fingerprint = ?");
    conn.query_row(&sql, [fingerprint], exception_from_row)
        .optional()?
        .ok_or_else(|| tt_core::Error::not_found("exception with fingerprint", fingerprint).into())
}

/// Inserts `exception` unless its fingerprint is already known, in any status.
/// Returns whether a row was written.
fn insert_exception(conn: &Connection, exception: &Exception) -> Result<bool, DbError> {
    let sql = format!(
        "INSERT INTO exceptions ({EXCEPTION_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(fingerprint) DO NOTHING"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let inserted = stmt.execute(params![
        exception.id.as_str(),
        exception.kind.as_str(),
        exception.severity.as_str(),
        exception.subject.kind_str(),
        exception.subject.id_str(),
        to_json(&exception.related)?,
        exception.user.as_str(),
        exception.workspace.as_str(),
        exception.date.map(|d| d.to_string()),
        exception.message,
        exception.fingerprint,
        exception.status.as_str(),
        format_timestamp(exception.created_at),
        exception.reviewed_by.as_ref().map(|u| u.as_str()),
        format_opt_timestamp(exception.reviewed_at),
        exception.note,
    ])?;
    if inserted == 0 {
        debug!(fingerprint = %exception.fingerprint, "finding already recorded");
        return Ok(false);
    }
    info!(
        exception = %exception.id,
        kind = %exception.kind,
        severity = %exception.severity,
        subject = %exception.subject,
        "exception raised"
    );
    Ok(true)
}

/// Persists findings whose fingerprint is not yet known, in any status.
///
/// Returns the exceptions actually created.
pub(crate) fn raise_findings(
    conn: &Connection,
    findings: Vec<Finding>,
    now: DateTime<Utc>,
) -> Result<Vec<Exception>, DbError> {
    let mut raised = Vec::new();
    for finding in findings {
        let exception = Exception::from_finding(finding, now);
        if insert_exception(conn, &exception)? {
            raised.push(exception);
        }
    }
    Ok(raised)
}

/// Like [`raise_findings`], but answers with the stored exception of every
/// finding, whether raised now or by an earlier scan.
fn record_findings(
    conn: &Connection,
    findings: Vec<Finding>,
    now: DateTime<Utc>,
) -> Result<ScanOutcome, DbError> {
    let mut outcome = ScanOutcome::default();
    let mut seen = HashSet::new();
    for finding in findings {
        let exception = Exception::from_finding(finding, now);
        if !seen.insert(exception.fingerprint.clone()) {
            continue;
        }
        if insert_exception(conn, &exception)? {
            outcome.raised.push(exception.id.clone());
            outcome.exceptions.push(exception);
        } else {
            outcome
                .exceptions
                .push(load_by_fingerprint(conn, &exception.fingerprint)?);
        }
    }
    Ok(outcome)
}

fn write_review(conn: &Connection, exception: &Exception) -> Result<(), DbError> {
    let changed = conn.execute(
        "
        UPDATE exceptions SET status = ?, reviewed_by = ?, reviewed_at = ?, note = ?
        WHERE id = ? AND status = ?
        ",
        params![
            exception.status.as_str(),
            exception.reviewed_by.as_ref().map(|u| u.as_str()),
            format_opt_timestamp(exception.reviewed_at),
            exception.note,
            exception.id.as_str(),
            ExceptionStatus::Open.as_str(),
        ],
    )?;
    ensure_written(changed, "exception", exception.id.as_str())
}

impl Database {
    /// Runs the rules of `scope` and returns the exception of every current
    /// finding. Findings seen by an earlier scan come back as stored, with
    /// their review status; only unseen ones are inserted.
    ///
    /// Scanning never changes entries or timesheets; a dirty timesheet is
    /// re-aggregated first so the scan sees its current totals.
    pub fn scan(&mut self, scope: &ScanScope, now: DateTime<Utc>) -> Result<ScanOutcome, DbError> {
        let tx = immediate(&mut self.conn)?;
        let findings = match scope {
            ScanScope::Timesheet(id) => {
                let mut timesheet = load_timesheet(&tx, id)?;
                let policy = self.policies.for_workspace(&timesheet.workspace);
                if timesheet.needs_recompute && timesheet.status.is_editable() {
                    recompute(&tx, &mut timesheet, policy, self.catalog.as_ref(), now)?
                } else {
                    let entries = query_entries(
                        &tx,
                        &EntryFilter {
                            user: Some(timesheet.user.clone()),
                            workspace: Some(timesheet.workspace.clone()),
                            from: Some(timesheet.period.start_instant()),
                            to: Some(timesheet.period.end_instant_exclusive()),
                        },
                    )?;
                    scan_timesheet(
                        &timesheet,
                        &entries,
                        policy,
                        self.catalog.as_ref(),
                        now.date_naive(),
                    )
                }
            }
            ScanScope::Entries {
                user,
                workspace,
                from,
                to,
            } => {
                let entries = query_entries(
                    &tx,
                    &EntryFilter {
                        user: Some(user.clone()),
                        workspace: Some(workspace.clone()),
                        from: Some(*from),
                        to: Some(*to),
                    },
                )?;
                scan_entries(
                    &entries,
                    self.policies.for_workspace(workspace),
                    self.catalog.as_ref(),
                )
            }
            ScanScope::Workspace {
                workspace,
                from,
                to,
            } => {
                let entries = query_entries(
                    &tx,
                    &EntryFilter {
                        user: None,
                        workspace: Some(workspace.clone()),
                        from: Some(*from),
                        to: Some(*to),
                    },
                )?;
                scan_workspace(
                    &entries,
                    self.policies.for_workspace(workspace),
                    self.catalog.as_ref(),
                )
            }
        };

        let outcome = record_findings(&tx, findings, now)?;
        tx.commit()?;
        info!(
            ?scope,
            found = outcome.exceptions.len(),
            raised = outcome.raised.len(),
            "scan complete"
        );
        Ok(outcome)
    }

    /// Exceptions matching `filter`, oldest first.
    pub fn exceptions(&self, filter: &ExceptionFilter) -> Result<Vec<Exception>, DbError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.to_string());
        }
        if let Some(subject) = &filter.subject {
            clauses.push("subject_type = ? AND subject_id = ?");
            values.push(subject.kind_str().to_string());
            values.push(subject.id_str().to_string());
        }
        if let Some(user) = &filter.user {
            clauses.push("user_id = ?");
            values.push(user.to_string());
        }
        if let Some(workspace) = &filter.workspace {
            clauses.push("workspace_id = ?");
            values.push(workspace.to_string());
        }
        let mut sql = format!("SELECT {EXCEPTION_COLUMNS} FROM exceptions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, fingerprint ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), exception_from_row)?;
        let mut exceptions = Vec::new();
        for row in rows {
            exceptions.push(row?);
        }
        Ok(exceptions)
    }

    pub fn resolve_exception(
        &mut self,
        id: &ExceptionId,
        reviewer: &UserId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Exception, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut exception = load_exception(&tx, id)?;
        exception.resolve(reviewer.clone(), note, now)?;
        write_review(&tx, &exception)?;
        tx.commit()?;
        info!(exception = %exception.id, by = %reviewer, "exception resolved");
        Ok(exception)
    }

    pub fn dismiss_exception(
        &mut self,
        id: &ExceptionId,
        reviewer: &UserId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Exception, DbError> {
        let tx = immediate(&mut self.conn)?;
        let mut exception = load_exception(&tx, id)?;
        exception.dismiss(reviewer.clone(), note, now)?;
        write_review(&tx, &exception)?;
        tx.commit()?;
        info!(exception = %exception.id, by = %reviewer, "exception dismissed");
        Ok(exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use tt_core::{
        ExceptionKind, NewTimeEntry, Period, ProjectId, Provenance, Severity, StaticCatalog, TaskId,
        TimeEntry,
    };

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    fn acme() -> WorkspaceId {
        WorkspaceId::new("acme").unwrap()
    }

    fn add(db: &mut Database, user: &str, start: DateTime<Utc>, minutes: i64, rate: Option<i64>) -> TimeEntry {
        db.create_entry(
            NewTimeEntry {
                user: UserId::new(user).unwrap(),
                workspace: acme(),
                project: Some(ProjectId::new("web").unwrap()),
                task: Some(TaskId::new("login").unwrap()),
                description: None,
                started_at: start,
                ended_at: start + Duration::minutes(minutes),
                billable: true,
                hourly_rate: rate.map(Decimal::from),
                tags: Vec::new(),
                provenance: Provenance::Manual,
                strict: false,
            },
            start,
        )
        .unwrap()
        .entry
    }

    fn db() -> Database {
        let catalog = StaticCatalog::default().with_project(
            ProjectId::new("web").unwrap(),
            acme(),
            Some(Decimal::from(100)),
        );
        Database::open_in_memory()
            .expect("open in-memory db")
            .with_catalog(Arc::new(catalog))
    }

    fn day_scope(user: &str) -> ScanScope {
        ScanScope::Entries {
            user: UserId::new(user).unwrap(),
            workspace: acme(),
            from: at(3, 0, 0),
            to: at(4, 0, 0),
        }
    }

    #[test]
    fn overlapping_entries_raise_exactly_one_exception() {
        let mut db = db();
        let a = add(&mut db, "alice", at(3, 9, 0), 60, None);
        let b = add(&mut db, "alice", at(3, 9, 30), 60, None);

        let first = db.scan(&day_scope("alice"), at(3, 12, 0)).unwrap();
        assert_eq!(first.exceptions.len(), 1);
        let raised = &first.exceptions[0];
        assert!(first.is_new(raised));
        assert_eq!(raised.kind, ExceptionKind::DuplicateEntry);
        assert_eq!(raised.severity, Severity::Medium);
        assert!(raised.related.contains(&a.id));
        assert!(raised.related.contains(&b.id));

        // Rescanning reports the same record without raising a new one.
        let again = db.scan(&day_scope("alice"), at(3, 13, 0)).unwrap();
        assert_eq!(again.exceptions, first.exceptions);
        assert!(again.raised.is_empty());
        assert_eq!(db.exceptions(&ExceptionFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn reviewed_exceptions_stay_reviewed() {
        let mut db = db();
        add(&mut db, "alice", at(3, 9, 0), 60, Some(150));
        let raised = db.scan(&day_scope("alice"), at(3, 12, 0)).unwrap().exceptions;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, ExceptionKind::RateMismatch);
        assert_eq!(raised[0].severity, Severity::High);

        let reviewer = UserId::new("bob").unwrap();
        let err = db
            .dismiss_exception(&raised[0].id, &reviewer, "  ", at(3, 13, 0))
            .unwrap_err();
        assert!(matches!(err.domain(), Some(tt_core::Error::Validation(_))));

        let dismissed = db
            .dismiss_exception(&raised[0].id, &reviewer, "agreed rush rate", at(3, 13, 0))
            .unwrap();
        assert_eq!(dismissed.status, ExceptionStatus::Dismissed);
        let err = db
            .resolve_exception(&raised[0].id, &reviewer, "fixed", at(3, 14, 0))
            .unwrap_err();
        assert!(matches!(
            err.domain(),
            Some(tt_core::Error::InvalidTransition { .. })
        ));

        let rescan = db.scan(&day_scope("alice"), at(3, 15, 0)).unwrap();
        assert!(rescan.raised.is_empty());
        assert_eq!(rescan.exceptions.len(), 1);
        assert_eq!(rescan.exceptions[0].status, ExceptionStatus::Dismissed);
        assert_eq!(rescan.exceptions[0].note.as_deref(), Some("agreed rush rate"));
        let open = db
            .exceptions(&ExceptionFilter {
                status: Some(ExceptionStatus::Open),
                ..ExceptionFilter::default()
            })
            .unwrap();
        assert!(open.is_empty());
    }

    #[test]
    fn workspace_scan_covers_every_user() {
        let mut db = db();
        add(&mut db, "alice", at(3, 8, 0), 9 * 60, None);
        add(&mut db, "bob", at(3, 8, 0), 10 * 60, None);
        add(&mut db, "carol", at(3, 8, 0), 60, None);

        let raised = db
            .scan(
                &ScanScope::Workspace {
                    workspace: acme(),
                    from: at(3, 0, 0),
                    to: at(10, 0, 0),
                },
                at(10, 0, 0),
            )
            .unwrap();
        let users: Vec<&str> = raised
            .exceptions
            .iter()
            .filter(|e| e.kind == ExceptionKind::Overtime)
            .map(|e| e.user.as_str())
            .collect();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&"alice"));
        assert!(users.contains(&"bob"));
    }

    #[test]
    fn timesheet_scan_reports_missing_days() {
        let mut db = db();
        add(&mut db, "alice", at(3, 9, 0), 60, None);
        let period = Period::new(
            NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 9).unwrap(),
        )
        .unwrap();
        let outcome = db
            .aggregate(&UserId::new("alice").unwrap(), &acme(), period, at(5, 12, 0))
            .unwrap();
        let missing: Vec<_> = outcome
            .exceptions
            .iter()
            .filter(|e| e.kind == ExceptionKind::MissingTime)
            .collect();
        // Tuesday and Wednesday only; later days have not happened yet.
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|e| e.severity == Severity::Medium));

        let later = db
            .scan(&ScanScope::Timesheet(outcome.timesheet.id.clone()), at(10, 0, 0))
            .unwrap();
        // Tuesday and Wednesday are reported again as their stored records.
        assert_eq!(later.exceptions.len(), 4);
        assert!(later.exceptions.iter().all(|e| e.kind == ExceptionKind::MissingTime));
        let dates: Vec<_> = later.new_exceptions().filter_map(|e| e.date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2025, 3, 6).unwrap(),
                NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
            ]
        );

        let by_subject = db
            .exceptions(&ExceptionFilter {
                subject: Some(Subject::Timesheet(outcome.timesheet.id.clone())),
                ..ExceptionFilter::default()
            })
            .unwrap();
        assert_eq!(by_subject.len(), 4);
    }
}
