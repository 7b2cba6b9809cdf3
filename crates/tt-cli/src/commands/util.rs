//! Shared utilities for CLI commands.

use std::io::Write;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use tt_core::{Exception, Period};

use crate::cli::PeriodArgs;

/// Pre-compiled regex for relative time parsing.
static RELATIVE_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").unwrap());

/// Conservative bounds for relative time parsing (~1000 years in minutes).
const MAX_RELATIVE_MINUTES: i64 = 1000 * 365 * 24 * 60;

/// Parse a datetime string as either ISO 8601 or relative time.
///
/// Supports:
/// - ISO 8601: "2026-01-15T10:30:00Z"
/// - Relative: "2 hours ago", "30 minutes ago", "1 day ago", "1 week ago"
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    parse_datetime_from(s, Utc::now())
}

/// [`parse_datetime`] with relative times counted back from `now`.
pub fn parse_datetime_from(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s.trim()) else {
        anyhow::bail!(
            "Invalid datetime: {s}. Use ISO 8601 (e.g., 2026-01-15T10:30:00Z) or relative (e.g., '2 hours ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;

    let (max_for_unit, minutes_per_unit) = match &caps[2] {
        "minute" => (MAX_RELATIVE_MINUTES, 1),
        "hour" => (MAX_RELATIVE_MINUTES / 60, 60),
        "day" => (MAX_RELATIVE_MINUTES / (60 * 24), 60 * 24),
        "week" => (MAX_RELATIVE_MINUTES / (60 * 24 * 7), 60 * 24 * 7),
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };

    if n > max_for_unit {
        anyhow::bail!("Relative time value too large: {n} {}", &caps[2]);
    }

    Ok(now - Duration::minutes(n * minutes_per_unit))
}

/// The instant given by `--at`, or now.
pub fn at_or_now(at: Option<&str>) -> Result<DateTime<Utc>> {
    at.map_or_else(|| Ok(Utc::now()), parse_datetime)
}

/// Parses a calendar date (YYYY-MM-DD).
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date: {s}. Use YYYY-MM-DD"))
}

/// The Monday-to-Sunday week containing `date`.
pub fn week_of(date: NaiveDate) -> Result<Period> {
    let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
    let sunday = monday + Days::new(6);
    Ok(Period::new(monday, sunday)?)
}

/// Resolves `--week` or `--from/--to`, defaulting to the week of `today`.
pub fn resolve_period(args: &PeriodArgs, today: NaiveDate) -> Result<Period> {
    match (&args.week, &args.from, &args.to) {
        (Some(week), _, _) => week_of(parse_date(week)?),
        (None, Some(from), Some(to)) => Ok(Period::new(parse_date(from)?, parse_date(to)?)?),
        _ => week_of(today),
    }
}

/// Whole minutes as `1h 50m`.
pub fn format_minutes(minutes: i64) -> String {
    let (hours, rest) = (minutes / 60, minutes % 60);
    match (hours, rest) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d %H:%M").to_string()
}

/// Pretty JSON followed by a newline.
pub fn write_json<W: Write, T: Serialize + ?Sized>(writer: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, value)?;
    writeln!(writer)?;
    Ok(())
}

/// One line per exception, for outcomes that raised some.
pub fn write_exceptions<W: Write>(writer: &mut W, exceptions: &[Exception]) -> Result<()> {
    for exception in exceptions {
        writeln!(
            writer,
            "! [{}] {}: {}",
            exception.severity, exception.kind, exception.message
        )?;
    }
    Ok(())
}

/// `-` for absent optional fields in tables.
pub fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_datetime_accepts_iso_and_relative() {
        let now = instant("2025-03-05T12:00:00Z");
        assert_eq!(
            parse_datetime_from("2025-03-03T09:00:00+01:00", now).unwrap(),
            instant("2025-03-03T08:00:00Z")
        );
        assert_eq!(
            parse_datetime_from("90 minutes ago", now).unwrap(),
            instant("2025-03-05T10:30:00Z")
        );
        assert_eq!(
            parse_datetime_from("1 week ago", now).unwrap(),
            instant("2025-02-26T12:00:00Z")
        );
    }

    #[test]
    fn test_parse_datetime_rejects_garbage_and_huge_values() {
        let now = instant("2025-03-05T12:00:00Z");
        assert!(parse_datetime_from("yesterday", now).is_err());
        assert!(parse_datetime_from("999999999 weeks ago", now).is_err());
    }

    #[test]
    fn test_week_of_spans_monday_to_sunday() {
        let period = week_of(parse_date("2025-03-06").unwrap()).unwrap();
        assert_eq!(period.start, parse_date("2025-03-03").unwrap());
        assert_eq!(period.end, parse_date("2025-03-09").unwrap());

        let sunday = week_of(parse_date("2025-03-09").unwrap()).unwrap();
        assert_eq!(sunday, period);
    }

    #[test]
    fn test_resolve_period_prefers_explicit_bounds() {
        let today = parse_date("2025-03-20").unwrap();
        let args = PeriodArgs {
            week: None,
            from: Some("2025-03-01".to_string()),
            to: Some("2025-03-15".to_string()),
        };
        let period = resolve_period(&args, today).unwrap();
        assert_eq!(period.start, parse_date("2025-03-01").unwrap());
        assert_eq!(period.end, parse_date("2025-03-15").unwrap());

        let default = resolve_period(
            &PeriodArgs {
                week: None,
                from: None,
                to: None,
            },
            today,
        )
        .unwrap();
        assert_eq!(default.start, parse_date("2025-03-17").unwrap());
    }

    #[test]
    fn test_format_minutes() {
        assert_eq!(format_minutes(45), "45m");
        assert_eq!(format_minutes(120), "2h");
        assert_eq!(format_minutes(110), "1h 50m");
    }
}
