//! Cron expression parsing and evaluation.
//!
//! Supports standard 5-field cron expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! as well as the descriptors `@yearly`, `@annually`, `@monthly`, `@weekly`,
//! `@daily`, `@midnight` and `@hourly`.
//!
//! When both day fields are restricted a day matches if either of them does,
//! following Vixie cron.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Years searched past the reference time before giving up. Covers the
/// eight-year gap between leap days around a skipped century leap year.
const SEARCH_HORIZON_YEARS: i32 = 9;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("value {value} is out of range [{min}, {max}] for '{field}'")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("invalid step value: {0}")]
    InvalidStep(String),
    #[error("unknown descriptor: {0}")]
    UnknownDescriptor(String),
}

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    /// The set of valid values for this field.
    pub values: BTreeSet<u32>,
    /// Minimum allowed value.
    pub min: u32,
    /// Maximum allowed value.
    pub max: u32,
    /// Whether the field was written as `*` or `?` (possibly with a step).
    pub unrestricted: bool,
    names: &'static [&'static str],
    names_offset: u32,
}

impl CronField {
    fn new(min: u32, max: u32) -> Self {
        Self {
            values: BTreeSet::new(),
            min,
            max,
            unrestricted: false,
            names: &[],
            names_offset: 0,
        }
    }

    fn with_names(mut self, names: &'static [&'static str], offset: u32) -> Self {
        self.names = names;
        self.names_offset = offset;
        self
    }

    /// Parse a field expression.
    fn parse(&mut self, expr: &str) -> Result<(), CronParseError> {
        self.unrestricted = expr.starts_with('*') || expr.starts_with('?');
        for part in expr.split(',') {
            self.parse_part(part.trim())?;
        }
        Ok(())
    }

    fn parse_value(&self, raw: &str, reason: &str) -> Result<u32, CronParseError> {
        if let Ok(value) = raw.parse::<u32>() {
            return Ok(value);
        }
        self.names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(raw))
            .map(|idx| idx as u32 + self.names_offset)
            .ok_or_else(|| CronParseError::InvalidField {
                field: raw.to_string(),
                reason: reason.to_string(),
            })
    }

    /// Parse a single part of a field expression.
    fn parse_part(&mut self, part: &str) -> Result<(), CronParseError> {
        // Step values (e.g., */5, 0-30/5, 10/15)
        let (range_part, step) = if let Some(idx) = part.find('/') {
            let step_str = &part[idx + 1..];
            let step = step_str
                .parse::<u32>()
                .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
            if step == 0 {
                return Err(CronParseError::InvalidStep("0".to_string()));
            }
            (&part[..idx], Some(step))
        } else {
            (part, None)
        };

        let (start, end) = if range_part == "*" || range_part == "?" {
            (self.min, self.max)
        } else if let Some(idx) = range_part.find('-') {
            let start = self.parse_value(&range_part[..idx], "invalid start of range")?;
            let end = self.parse_value(&range_part[idx + 1..], "invalid end of range")?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = self.parse_value(range_part, "invalid value")?;
            // "a/n" means "from a to the end of the range, every n"
            if step.is_some() {
                (value, self.max)
            } else {
                (value, value)
            }
        };

        if start < self.min || end > self.max {
            return Err(CronParseError::OutOfRange {
                field: range_part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            self.values.insert(value);
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }

        Ok(())
    }

    /// Check if a value matches this field.
    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    /// Original expression string.
    pub expr: String,
    /// Minute field (0-59).
    pub minute: CronField,
    /// Hour field (0-23).
    pub hour: CronField,
    /// Day of month field (1-31).
    pub day_of_month: CronField,
    /// Month field (1-12).
    pub month: CronField,
    /// Day of week field (0-6, 0 = Sunday).
    pub day_of_week: CronField,
}

impl CronExpr {
    /// Parse a cron expression string.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let trimmed = expr.trim();
        let fields = if let Some(descriptor) = trimmed.strip_prefix('@') {
            match descriptor.to_ascii_lowercase().as_str() {
                "yearly" | "annually" => "0 0 1 1 *",
                "monthly" => "0 0 1 * *",
                "weekly" => "0 0 * * 0",
                "daily" | "midnight" => "0 0 * * *",
                "hourly" => "0 * * * *",
                _ => return Err(CronParseError::UnknownDescriptor(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let parts: Vec<&str> = fields.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::InvalidFieldCount(parts.len()));
        }

        let mut minute = CronField::new(0, 59);
        let mut hour = CronField::new(0, 23);
        let mut day_of_month = CronField::new(1, 31);
        let mut month = CronField::new(1, 12).with_names(&MONTH_NAMES, 1);
        let mut day_of_week = CronField::new(0, 7).with_names(&WEEKDAY_NAMES, 0);

        minute.parse(parts[0])?;
        hour.parse(parts[1])?;
        day_of_month.parse(parts[2])?;
        month.parse(parts[3])?;
        day_of_week.parse(parts[4])?;

        // 7 is an alias for Sunday
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }
        day_of_week.max = 6;

        Ok(Self {
            expr: expr.to_string(),
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        })
    }

    /// Check whether the calendar day of `dt` is selected.
    fn day_matches(&self, dt: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.matches(dt.day());
        let dow = self
            .day_of_week
            .matches(dt.weekday().num_days_from_sunday());

        if self.day_of_month.unrestricted || self.day_of_week.unrestricted {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Check if a datetime matches this cron expression.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.month.matches(dt.month())
            && self.day_matches(dt)
    }

    /// Calculate the first run time strictly after the given datetime.
    ///
    /// Returns `None` when the expression cannot fire within the search
    /// horizon, e.g. `0 0 30 2 *`.
    pub fn next_run(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Start from the next whole minute
        let mut current = (*after + Duration::minutes(1))
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))?;
        let last_year = after.year() + SEARCH_HORIZON_YEARS;

        while current.year() <= last_year {
            if !self.month.matches(current.month()) {
                current = start_of_next_month(&current)?;
                continue;
            }
            if !self.day_matches(&current) {
                current = start_of_next_day(&current)?;
                continue;
            }
            if !self.hour.matches(current.hour()) {
                current = current.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(current.minute()) {
                current += Duration::minutes(1);
                continue;
            }
            return Some(current);
        }

        None
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

fn start_of_next_day(dt: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = dt.date_naive().succ_opt()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(dt: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
