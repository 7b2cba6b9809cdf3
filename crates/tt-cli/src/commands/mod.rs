//! CLI subcommand implementations.
//!
//! Every command writes to a caller-supplied writer and prints JSON instead
//! of text when the session asks for it.

pub mod entry;
pub mod exceptions;
pub mod status;
pub mod timer;
pub mod timesheet;
pub mod util;
