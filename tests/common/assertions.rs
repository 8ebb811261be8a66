// Custom test assertions for integration tests

use snapsched::crd::{ConditionStatus, ScheduleCondition, SnapshotScheduleStatus};

/// Fetch a condition, failing the test when it is missing.
pub fn condition<'a>(status: &'a SnapshotScheduleStatus, kind: &str) -> &'a ScheduleCondition {
    status
        .condition(kind)
        .unwrap_or_else(|| panic!("condition {} missing from {:?}", kind, status.conditions))
}

/// Assert a condition's status and reason.
pub fn assert_condition(
    status: &SnapshotScheduleStatus,
    kind: &str,
    expected: ConditionStatus,
    reason: &str,
) {
    let actual = condition(status, kind);
    assert_eq!(
        (actual.status, actual.reason.as_str()),
        (expected, reason),
        "condition {} has unexpected state: {:?}",
        kind,
        actual
    );
}
