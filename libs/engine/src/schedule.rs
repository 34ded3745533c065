//! Interval arithmetic and the due check.
//!
//! Both are pure so they can be tested without a scheduler or a store.

use crate::models::Job;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use std::str::FromStr;
use tracing::warn;

/// Format of the bare local timestamps accepted for `start_date`.
pub const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Unit of a job's repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl IntervalUnit {
    pub const ALL: [IntervalUnit; 4] = [
        IntervalUnit::Minutes,
        IntervalUnit::Hours,
        IntervalUnit::Days,
        IntervalUnit::Weeks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
            IntervalUnit::Weeks => "weeks",
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntervalUnit::ALL
            .into_iter()
            .find(|unit| unit.as_str() == s)
            .ok_or_else(|| format!("invalid interval unit: {s}"))
    }
}

/// Convert an interval to a duration.
///
/// Unknown units, non-positive values and overflow all yield
/// `Duration::zero()`, which callers treat as "no valid interval".
pub fn interval_duration(value: i64, unit: &str) -> Duration {
    if value <= 0 {
        return Duration::zero();
    }
    let duration = match unit.parse::<IntervalUnit>() {
        Ok(IntervalUnit::Minutes) => Duration::try_minutes(value),
        Ok(IntervalUnit::Hours) => Duration::try_hours(value),
        Ok(IntervalUnit::Days) => Duration::try_days(value),
        Ok(IntervalUnit::Weeks) => Duration::try_weeks(value),
        Err(_) => None,
    };
    duration.unwrap_or_else(Duration::zero)
}

/// Parse an RFC 3339 timestamp, or a bare `YYYY-MM-DDTHH:MM` in local time.
pub fn parse_schedule_time(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, LOCAL_DATETIME_FORMAT)?;
    // Nonexistent local times (DST gaps) are read as UTC.
    Ok(Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive)))
}

/// Format a timestamp the way run state is persisted.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Whether `job` should run at `now`.
pub fn is_due(job: &Job, now: DateTime<Utc>) -> bool {
    if !job.active {
        return false;
    }
    // In-flight jobs are owned by another execution path.
    if job.status.is_in_flight() {
        return false;
    }

    let interval = interval_duration(job.interval_value, &job.interval_unit);
    if interval.is_zero() {
        return false;
    }

    let reference = match job.last_run.as_deref().filter(|value| !value.is_empty()) {
        Some(last_run) => last_run,
        None if !job.start_date.is_empty() => job.start_date.as_str(),
        None => return false,
    };

    let reference_time = match parse_schedule_time(reference) {
        Ok(time) => time,
        Err(error) => {
            warn!(
                job_id = %job.id,
                reference = %reference,
                error = %error,
                "Cannot parse schedule reference time"
            );
            return false;
        }
    };

    match reference_time.checked_add_signed(interval) {
        Some(due_at) => due_at <= now,
        None => false,
    }
}
