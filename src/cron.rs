//! The named-interval subset of cron understood by the scheduler.
//!
//! Supported expressions:
//!
//! - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly` (alias
//!   `@annually`): the start of the next calendar boundary after the base
//!   time. `@hourly` truncates to the hour and adds one hour rather than
//!   adding an hour to the base, so repeated evaluation does not drift.
//! - `@every <duration>`: plain duration addition to the base time, where
//!   duration is an integer followed by one of `ns`, `us`, `ms`, `s`, `m`,
//!   `h`, or `d` (`d` is expanded as `N*24h`; days are not a native unit).
//!
//! Standard 5-7 field cron syntax is deliberately rejected with
//! [`CronError::StandardSyntaxUnsupported`] instead of being misread.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,
    #[error("standard cron field syntax is not yet supported: {0:?}")]
    StandardSyntaxUnsupported(String),
    #[error("unrecognised cron token: {0:?}")]
    UnrecognisedToken(String),
    #[error("invalid @every duration: {0:?}")]
    InvalidDuration(String),
    #[error("computed next run time is out of range")]
    TimeOutOfRange,
}

/// A parsed recurring schedule expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronSchedule {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Every(TimeDelta),
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(CronError::Empty);
        }
        if !expression.starts_with('@') {
            return Err(CronError::StandardSyntaxUnsupported(expression.to_owned()));
        }
        match expression {
            "@hourly" => Ok(Self::Hourly),
            "@daily" => Ok(Self::Daily),
            "@weekly" => Ok(Self::Weekly),
            "@monthly" => Ok(Self::Monthly),
            "@yearly" | "@annually" => Ok(Self::Yearly),
            _ => match expression.strip_prefix("@every") {
                Some(duration) => Ok(Self::Every(parse_duration(duration.trim())?)),
                None => Err(CronError::UnrecognisedToken(expression.to_owned())),
            },
        }
    }
}

impl CronSchedule {
    /// Checks that `expression` parses, without needing a base time.
    pub fn validate(expression: &str) -> Result<(), CronError> {
        expression.parse::<Self>().map(|_| ())
    }

    /// The first occurrence strictly after `base`.
    pub fn next_after(&self, base: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let date = base.date_naive();
        match self {
            Self::Hourly => {
                let this_hour = date
                    .and_hms_opt(base.hour(), 0, 0)
                    .ok_or(CronError::TimeOutOfRange)?
                    .and_utc();
                this_hour
                    .checked_add_signed(TimeDelta::hours(1))
                    .ok_or(CronError::TimeOutOfRange)
            }
            Self::Daily => start_of_day(date.checked_add_days(Days::new(1))),
            Self::Weekly => {
                // Week boundary is Sunday 00:00, matching cron's `@weekly`.
                let until_sunday = 7 - date.weekday().num_days_from_sunday() as u64;
                start_of_day(date.checked_add_days(Days::new(until_sunday)))
            }
            Self::Monthly => {
                let (year, month) = match date.month() {
                    12 => (date.year() + 1, 1),
                    month => (date.year(), month + 1),
                };
                start_of_day(NaiveDate::from_ymd_opt(year, month, 1))
            }
            Self::Yearly => start_of_day(NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)),
            Self::Every(delta) => base
                .checked_add_signed(*delta)
                .ok_or(CronError::TimeOutOfRange),
        }
    }
}

fn start_of_day(date: Option<NaiveDate>) -> Result<DateTime<Utc>, CronError> {
    date.map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .ok_or(CronError::TimeOutOfRange)
}

fn parse_duration(input: &str) -> Result<TimeDelta, CronError> {
    let invalid = || CronError::InvalidDuration(input.to_owned());
    let digits = input.len() - input.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Err(invalid());
    }
    let (value, unit) = input.split_at(digits);
    let value: i64 = value.parse().map_err(|_| invalid())?;
    match unit {
        "ns" => Ok(TimeDelta::nanoseconds(value)),
        "us" => Ok(TimeDelta::microseconds(value)),
        "ms" => TimeDelta::try_milliseconds(value).ok_or_else(invalid),
        "s" => TimeDelta::try_seconds(value).ok_or_else(invalid),
        "m" => TimeDelta::try_minutes(value).ok_or_else(invalid),
        "h" => TimeDelta::try_hours(value).ok_or_else(invalid),
        // Days are not a native duration unit; a whole-day count is
        // special-cased as N*24h.
        "d" => value
            .checked_mul(24)
            .and_then(TimeDelta::try_hours)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}
