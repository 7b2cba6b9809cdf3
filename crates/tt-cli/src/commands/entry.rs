//! Manual time entry commands.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tt_core::{EntryChanges, NewTimeEntry, ProjectId, Provenance, TaskId, TimeEntry, TimeEntryId, WorkspaceId};
use tt_db::EntryFilter;

use crate::commands::util::{format_instant, format_minutes, or_dash, write_exceptions, write_json};
use crate::session::Session;

/// Fields of `tt entry add`.
#[derive(Debug, Clone)]
pub struct AddArgs {
    pub workspace: WorkspaceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub project: Option<ProjectId>,
    pub task: Option<TaskId>,
    pub description: Option<String>,
    pub rate: Option<Decimal>,
    pub billable: bool,
    pub tags: Vec<String>,
    pub imported: bool,
    pub strict: bool,
}

pub fn add<W: Write>(writer: &mut W, session: &mut Session, args: AddArgs, now: DateTime<Utc>) -> Result<()> {
    let input = NewTimeEntry {
        user: session.user()?.clone(),
        workspace: args.workspace,
        project: args.project,
        task: args.task,
        description: args.description,
        started_at: args.started_at,
        ended_at: args.ended_at,
        billable: args.billable,
        hourly_rate: args.rate,
        tags: args.tags,
        provenance: if args.imported {
            Provenance::Imported
        } else {
            Provenance::Manual
        },
        strict: args.strict,
    };
    let outcome = session.db.create_entry(input, now)?;

    if session.json {
        return write_json(
            writer,
            &json!({ "entry": outcome.entry, "exceptions": outcome.exceptions }),
        );
    }
    let entry = &outcome.entry;
    writeln!(
        writer,
        "Recorded entry {}: {}, cost {:.2}",
        entry.id,
        format_minutes(entry.duration_minutes),
        entry.cost
    )?;
    write_exceptions(writer, &outcome.exceptions)
}

/// Lists the acting user's entries starting in `[from, to)`.
pub fn list<W: Write>(
    writer: &mut W,
    session: &Session,
    workspace: Option<WorkspaceId>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<()> {
    let entries = session.db.list_entries(&EntryFilter {
        user: Some(session.user()?.clone()),
        workspace,
        from,
        to,
    })?;

    if session.json {
        return write_json(writer, &entries);
    }
    if entries.is_empty() {
        writeln!(writer, "No entries.")?;
        return Ok(());
    }
    for entry in &entries {
        write_row(writer, entry)?;
    }
    let minutes: i64 = entries.iter().map(|e| e.duration_minutes).sum();
    let cost: Decimal = entries.iter().map(|e| e.cost).sum();
    writeln!(writer, "Total: {}, cost {cost:.2}", format_minutes(minutes))?;
    Ok(())
}

/// Fields `tt entry edit` may change. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct EditArgs {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub rate: Option<Decimal>,
    pub billable: Option<bool>,
}

pub fn edit<W: Write>(
    writer: &mut W,
    session: &mut Session,
    id: &TimeEntryId,
    args: EditArgs,
    now: DateTime<Utc>,
) -> Result<()> {
    let changes = EntryChanges {
        started_at: args.started_at,
        ended_at: args.ended_at,
        description: args.description.map(|d| Some(d).filter(|d| !d.trim().is_empty())),
        hourly_rate: args.rate.map(Some),
        billable: args.billable,
        ..EntryChanges::default()
    };
    let outcome = session.db.update_entry(id, changes, now)?;

    if session.json {
        return write_json(
            writer,
            &json!({ "entry": outcome.entry, "exceptions": outcome.exceptions }),
        );
    }
    writeln!(writer, "Updated entry {id}")?;
    write_row(writer, &outcome.entry)?;
    write_exceptions(writer, &outcome.exceptions)
}

pub fn delete<W: Write>(writer: &mut W, session: &mut Session, id: &TimeEntryId, now: DateTime<Utc>) -> Result<()> {
    session.db.delete_entry(id, now)?;
    if session.json {
        return write_json(writer, &json!({ "deleted": id }));
    }
    writeln!(writer, "Deleted entry {id}")?;
    Ok(())
}

fn write_row<W: Write>(writer: &mut W, entry: &TimeEntry) -> Result<()> {
    writeln!(
        writer,
        "{}  {} -> {}  {:>7}  {}/{}  {:.2}  {} {}",
        entry.id,
        format_instant(entry.started_at),
        entry.ended_at.format("%H:%M"),
        format_minutes(entry.duration_minutes),
        or_dash(entry.project.as_ref()),
        or_dash(entry.task.as_ref()),
        entry.cost,
        entry.provenance,
        entry.status,
    )?;
    Ok(())
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
            catalog: StaticCatalog::default()
                .with_project("web".parse().unwrap(), "acme".parse().unwrap(), Some(Decimal::from(100)))
                .with_project("ops".parse().unwrap(), "acme".parse().unwrap(), Some(Decimal::from(80))),
            ..Config::default()
        };
        Session::new(Database::open_in_memory().unwrap(), config, None, false).unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        parse_datetime(s).unwrap()
    }

    fn add_args(project: &str, start: &str, end: &str) -> AddArgs {
        AddArgs {
            workspace: "acme".parse().unwrap(),
            started_at: at(start),
            ended_at: at(end),
            project: Some(project.parse().unwrap()),
            task: None,
            description: None,
            rate: None,
            billable: true,
            tags: Vec::new(),
            imported: false,
            strict: false,
        }
    }

    fn ids(session: &Session) -> Vec<TimeEntryId> {
        session
            .db
            .list_entries(&EntryFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    #[test]
    fn list_shows_rows_and_totals() {
        let mut session = session();
        let now = at("2025-03-04T18:00:00Z");
        let mut sink = Vec::new();
        add(&mut sink, &mut session, add_args("web", "2025-03-03T09:00:00Z", "2025-03-03T10:30:00Z"), now).unwrap();
        add(&mut sink, &mut session, add_args("ops", "2025-03-04T13:00:00Z", "2025-03-04T15:00:00Z"), now).unwrap();

        let mut output = Vec::new();
        list(&mut output, &session, None, None, None).unwrap();
        let mut output = String::from_utf8(output).unwrap();
        for (n, id) in ids(&session).iter().enumerate() {
            output = output.replace(id.as_str(), &format!("[ENTRY{}]", n + 1));
        }
        assert_snapshot!(output, @r"
[ENTRY1]  2025-03-03 09:00 -> 10:30   1h 30m  web/-  150.00  manual draft
[ENTRY2]  2025-03-04 13:00 -> 15:00       2h  ops/-  160.00  manual draft
Total: 3h 30m, cost 310.00
");
    }

    #[test]
    fn duplicate_is_flagged_then_refused_when_strict() {
        let mut session = session();
        let now = at("2025-03-04T18:00:00Z");
        let mut sink = Vec::new();
        add(&mut sink, &mut session, add_args("web", "2025-03-03T09:00:00Z", "2025-03-03T10:00:00Z"), now).unwrap();

        let mut output = Vec::new();
        add(&mut output, &mut session, add_args("web", "2025-03-03T09:00:00Z", "2025-03-03T10:00:00Z"), now).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("duplicate_entry"), "{output}");

        let strict = AddArgs {
            strict: true,
            ..add_args("web", "2025-03-03T09:00:00Z", "2025-03-03T10:00:00Z")
        };
        assert!(add(&mut Vec::new(), &mut session, strict, now).is_err());
        assert_eq!(ids(&session).len(), 2);
    }

    #[test]
    fn edit_and_delete() {
        let mut session = session();
        let now = at("2025-03-04T18:00:00Z");
        add(
            &mut Vec::new(),
            &mut session,
            add_args("web", "2025-03-03T09:00:00Z", "2025-03-03T10:00:00Z"),
            now,
        )
        .unwrap();
        let id = ids(&session).remove(0);

        let args = EditArgs {
            ended_at: Some(at("2025-03-03T11:00:00Z")),
            ..EditArgs::default()
        };
        edit(&mut Vec::new(), &mut session, &id, args, now).unwrap();
        let entry = session.db.entry(&id).unwrap();
        assert_eq!(entry.duration_minutes, 120);
        assert_eq!(entry.cost, Decimal::from(200));

        let mut output = Vec::new();
        delete(&mut output, &mut session, &id, now).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), format!("Deleted entry {id}\n"));
        assert!(ids(&session).is_empty());
    }
}
