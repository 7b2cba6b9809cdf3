//! Time tracker CLI library.
//!
//! This crate provides the CLI interface for the time tracker.

mod cli;
pub mod commands;
mod config;
mod session;

pub use cli::{
    AtArg, Cli, Commands, EntryAction, ExceptionAction, PeriodArgs, TimerAction, TimesheetAction,
};
pub use config::Config;
pub use session::Session;
