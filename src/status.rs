//! Status tracking for schedules.
//!
//! Folds the outcome of one reconcile into a schedule's status. The fold is
//! deterministic: applying the same outcome twice yields the same status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crd::{ConditionStatus, ScheduleCondition, SnapshotScheduleStatus};

/// Condition type: automatic snapshotting is off.
pub const CONDITION_SCHEDULING_DISABLED: &str = "SchedulingDisabled";
/// Condition type: the last reconcile hit failures.
pub const CONDITION_FAILED: &str = "Failed";
/// Condition type: the last reconcile pass completed.
pub const CONDITION_RECONCILED: &str = "Reconciled";

pub const REASON_DISABLED: &str = "Disabled";
pub const REASON_ENABLED: &str = "Enabled";
pub const REASON_SUCCEEDED: &str = "Succeeded";
pub const REASON_RECONCILE_COMPLETE: &str = "ReconcileComplete";

/// Category of a reconcile failure.
///
/// Ordered by precedence: when several kinds occur, the first one names the
/// `Failed` condition's reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    MalformedSchedule,
    NotScheduled,
    InvalidRetention,
    VolumeListFailed,
    SnapshotCreateFailed,
    SnapshotListFailed,
    SnapshotDeleteFailed,
}

impl FailureKind {
    pub fn reason(&self) -> &'static str {
        match self {
            FailureKind::MalformedSchedule => "MalformedSchedule",
            FailureKind::NotScheduled => "NotScheduled",
            FailureKind::InvalidRetention => "InvalidRetention",
            FailureKind::VolumeListFailed => "VolumeListFailed",
            FailureKind::SnapshotCreateFailed => "SnapshotCreateFailed",
            FailureKind::SnapshotListFailed => "SnapshotListFailed",
            FailureKind::SnapshotDeleteFailed => "SnapshotDeleteFailed",
        }
    }
}

/// One failure observed during a reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Summary of one reconcile pass, as seen by the status tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Automatic snapshotting is off (no expression or `disabled`).
    pub scheduling_disabled: bool,
    /// Failures in the order they were observed.
    pub failures: Vec<Failure>,
    /// New `lastSnapshotTime`, or `None` to keep the previous value.
    pub last_snapshot_time: Option<DateTime<Utc>>,
    /// New `nextSnapshotTime`; `None` clears it.
    pub next_snapshot_time: Option<DateTime<Utc>>,
}

impl CycleOutcome {
    pub fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.failures.push(Failure::new(kind, detail));
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn failure_reason(&self) -> Option<&'static str> {
        self.failures.iter().map(|f| f.kind).min().map(|k| k.reason())
    }

    fn failure_message(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.kind.reason(), f.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Set a condition, keeping `lastTransitionTime` unless status or reason
/// changed.
pub fn set_condition(
    conditions: &mut Vec<ScheduleCondition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => {
            if existing.status != status || existing.reason != reason {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
        }
        None => conditions.push(ScheduleCondition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        }),
    }
}

/// Fold `outcome` into `previous`.
pub fn apply_outcome(
    previous: Option<&SnapshotScheduleStatus>,
    outcome: &CycleOutcome,
    now: DateTime<Utc>,
) -> SnapshotScheduleStatus {
    let mut status = previous.cloned().unwrap_or_default();

    if outcome.scheduling_disabled {
        set_condition(
            &mut status.conditions,
            CONDITION_SCHEDULING_DISABLED,
            ConditionStatus::True,
            REASON_DISABLED,
            "Automatic snapshots are disabled",
            now,
        );
    } else {
        set_condition(
            &mut status.conditions,
            CONDITION_SCHEDULING_DISABLED,
            ConditionStatus::False,
            REASON_ENABLED,
            "",
            now,
        );
    }

    match outcome.failure_reason() {
        Some(reason) => set_condition(
            &mut status.conditions,
            CONDITION_FAILED,
            ConditionStatus::True,
            reason,
            outcome.failure_message(),
            now,
        ),
        None => set_condition(
            &mut status.conditions,
            CONDITION_FAILED,
            ConditionStatus::False,
            REASON_SUCCEEDED,
            "",
            now,
        ),
    }

    set_condition(
        &mut status.conditions,
        CONDITION_RECONCILED,
        ConditionStatus::True,
        REASON_RECONCILE_COMPLETE,
        "",
        now,
    );

    if let Some(last) = outcome.last_snapshot_time {
        status.last_snapshot_time = Some(last);
    }
    status.next_snapshot_time = outcome.next_snapshot_time;

    status
}
