//! Scheduling module for snapsched.
//!
//! Evaluates cron expressions for snapshot schedules. Evaluation is pure: the
//! only notion of time is the reference instant passed in by the caller.

mod cron;

pub use cron::{CronExpr, CronField, CronParseError};

use chrono::{DateTime, Utc};

use crate::error::{Result, SnapschedError};

/// Parse an expression, mapping parse failures to [`SnapschedError::MalformedSchedule`].
pub fn parse_schedule(expression: &str) -> Result<CronExpr> {
    CronExpr::parse(expression).map_err(|e| SnapschedError::MalformedSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Compute the next occurrence of `expression` strictly after `after`.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = parse_schedule(expression)?;
    next_after(&cron, after)
}

/// Compute the next occurrence of an already parsed expression.
pub fn next_after(cron: &CronExpr, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron.next_run(&after)
        .ok_or_else(|| SnapschedError::NotScheduled(cron.expr.clone()))
}
