use std::io::Write;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tt_cli::commands::util::{at_or_now, parse_datetime, resolve_period};
use tt_cli::commands::{entry, exceptions, status, timer, timesheet};
use tt_cli::{Cli, Commands, EntryAction, ExceptionAction, Session, TimerAction, TimesheetAction};
use tt_core::Subject;

fn run_timer<W: Write>(out: &mut W, session: &mut Session, action: &TimerAction) -> Result<()> {
    match action {
        TimerAction::Start {
            workspace,
            project,
            task,
            description,
            rate,
            non_billable,
            at,
        } => {
            let args = timer::StartArgs {
                workspace: workspace.clone(),
                project: project.clone(),
                task: task.clone(),
                description: description.clone(),
                rate: *rate,
                billable: !non_billable,
            };
            timer::start(out, session, args, at_or_now(at.at.as_deref())?)
        }
        TimerAction::Pause { at } => timer::pause(out, session, at_or_now(at.at.as_deref())?),
        TimerAction::Resume { at } => timer::resume(out, session, at_or_now(at.at.as_deref())?),
        TimerAction::Stop { at } => timer::stop(out, session, at_or_now(at.at.as_deref())?),
        TimerAction::Show { at } => timer::show(out, session, at_or_now(at.at.as_deref())?),
        TimerAction::Activity { at } => timer::activity(out, session, at_or_now(at.at.as_deref())?),
        TimerAction::Idle { from, to, reason } => timer::idle(
            out,
            session,
            parse_datetime(from)?,
            parse_datetime(to)?,
            (*reason).into(),
        ),
        TimerAction::Sweep { at } => timer::sweep(out, session, at_or_now(at.at.as_deref())?),
    }
}

fn run_entry<W: Write>(out: &mut W, session: &mut Session, action: &EntryAction) -> Result<()> {
    let now = chrono::Utc::now();
    match action {
        EntryAction::Add {
            workspace,
            start,
            end,
            project,
            task,
            description,
            rate,
            non_billable,
            tags,
            imported,
            strict,
        } => {
            let args = entry::AddArgs {
                workspace: workspace.clone(),
                started_at: parse_datetime(start)?,
                ended_at: parse_datetime(end)?,
                project: project.clone(),
                task: task.clone(),
                description: description.clone(),
                rate: *rate,
                billable: !non_billable,
                tags: tags.clone(),
                imported: *imported,
                strict: *strict,
            };
            entry::add(out, session, args, now)
        }
        EntryAction::List {
            workspace,
            from,
            to,
        } => entry::list(
            out,
            session,
            workspace.clone(),
            from.as_deref().map(parse_datetime).transpose()?,
            to.as_deref().map(parse_datetime).transpose()?,
        ),
        EntryAction::Edit {
            id,
            start,
            end,
            description,
            rate,
            billable,
        } => {
            let args = entry::EditArgs {
                started_at: start.as_deref().map(parse_datetime).transpose()?,
                ended_at: end.as_deref().map(parse_datetime).transpose()?,
                description: description.clone(),
                rate: *rate,
                billable: *billable,
            };
            entry::edit(out, session, id, args, now)
        }
        EntryAction::Delete { id } => entry::delete(out, session, id, now),
    }
}

fn run_timesheet<W: Write>(out: &mut W, session: &mut Session, action: &TimesheetAction) -> Result<()> {
    let now = chrono::Utc::now();
    match action {
        TimesheetAction::Aggregate { workspace, period } => {
            let period = resolve_period(period, now.date_naive())?;
            timesheet::aggregate(out, session, workspace, period, now)
        }
        TimesheetAction::Show { id } => timesheet::show(out, session, id, now),
        TimesheetAction::List {
            workspace,
            status,
            all_users,
        } => timesheet::list(
            out,
            session,
            workspace.clone(),
            status.map(Into::into),
            *all_users,
        ),
        TimesheetAction::Submit { id } => timesheet::submit(out, session, id, now),
        TimesheetAction::Decide {
            id,
            verdict,
            comments,
            approved_hours,
            expected_version,
        } => {
            let args = timesheet::DecideArgs {
                verdict: (*verdict).into(),
                comments: comments.clone(),
                approved_hours: *approved_hours,
                expected_version: *expected_version,
            };
            timesheet::decide(out, session, id, args, now)
        }
        TimesheetAction::Lock { id } => timesheet::lock(out, session, id, now),
        TimesheetAction::Reopen { id } => timesheet::reopen(out, session, id, now),
        TimesheetAction::Override {
            bucket,
            hours,
            rate,
            notes,
        } => {
            let args = timesheet::OverrideArgs {
                hours: *hours,
                rate: *rate,
                notes: notes.clone(),
            };
            timesheet::set_override(out, session, bucket, args, now)
        }
        TimesheetAction::Approvals { id } => timesheet::approvals(out, session, id),
        TimesheetAction::Sweep { at } => timesheet::sweep(out, session, at_or_now(at.at.as_deref())?),
    }
}

fn run_exceptions<W: Write>(out: &mut W, session: &mut Session, action: &ExceptionAction) -> Result<()> {
    let now = chrono::Utc::now();
    match action {
        ExceptionAction::Scan {
            timesheet,
            workspace,
            all_users,
            period,
        } => {
            let target = match (timesheet, workspace) {
                (Some(id), _) => exceptions::ScanTarget::Timesheet(id.clone()),
                (None, Some(workspace)) => exceptions::ScanTarget::Workspace {
                    workspace: workspace.clone(),
                    period: resolve_period(period, now.date_naive())?,
                    all_users: *all_users,
                },
                (None, None) => anyhow::bail!("pass --timesheet or --workspace"),
            };
            exceptions::scan(out, session, target, now)
        }
        ExceptionAction::List {
            status,
            all_users,
            timesheet,
            entry,
        } => {
            let subject = match (timesheet, entry) {
                (Some(id), _) => Some(Subject::Timesheet(id.clone())),
                (None, Some(id)) => Some(Subject::TimeEntry(id.clone())),
                (None, None) => None,
            };
            let args = exceptions::ListArgs {
                status: status.map(Into::into),
                subject,
                all_users: *all_users,
            };
            exceptions::list(out, session, args)
        }
        ExceptionAction::Resolve { id, note } => exceptions::resolve(out, session, id, note, now),
        ExceptionAction::Dismiss { id, note } => exceptions::dismiss(out, session, id, note, now),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so JSON output stays parseable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let mut session = Session::open(cli.config.as_deref(), cli.user.clone(), cli.json)?;
    let mut out = std::io::stdout().lock();
    match command {
        Commands::Status => status::run(&mut out, &session, chrono::Utc::now()),
        Commands::Timer(action) => run_timer(&mut out, &mut session, action),
        Commands::Entry(action) => run_entry(&mut out, &mut session, action),
        Commands::Timesheet(action) => run_timesheet(&mut out, &mut session, action),
        Commands::Exceptions(action) => run_exceptions(&mut out, &mut session, action),
    }
}
