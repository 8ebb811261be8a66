//! Custom Resource Definitions for snapsched

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// SnapshotSchedule CRD
// ============================================================================

/// SnapshotSchedule periodically snapshots the PersistentVolumeClaims matched
/// by its selector and prunes the results according to its retention policy.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapscheduler.backube",
    version = "v1",
    kind = "SnapshotSchedule",
    plural = "snapshotschedules",
    shortname = "snapsched",
    status = "SnapshotScheduleStatus",
    namespaced,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.scheduleExpression"}"#,
    printcolumn = r#"{"name":"Max age","type":"string","jsonPath":".spec.retention.maxAge"}"#,
    printcolumn = r#"{"name":"Max num","type":"integer","jsonPath":".spec.retention.maxCount"}"#,
    printcolumn = r#"{"name":"Disabled","type":"boolean","jsonPath":".spec.disabled"}"#,
    printcolumn = r#"{"name":"Next snapshot","type":"string","jsonPath":".status.nextSnapshotTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotScheduleSpec {
    /// Cron expression (5 fields or an `@descriptor`). Absent means never due.
    #[serde(default, alias = "schedule", skip_serializing_if = "Option::is_none")]
    pub schedule_expression: Option<String>,

    /// Selects the PersistentVolumeClaims to snapshot. Empty selects all.
    #[serde(default, alias = "claimSelector")]
    pub volume_selector: LabelSelector,

    /// Retention policy for snapshots created by this schedule
    #[serde(default)]
    pub retention: RetentionSpec,

    /// Template applied to each created snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_template: Option<SnapshotTemplateSpec>,

    /// Suspend snapshot creation while keeping retention active
    #[serde(default)]
    pub disabled: bool,
}

/// Retention policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSpec {
    /// Keep at most this many snapshots (must be positive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i32>,

    /// Delete snapshots older than this duration, e.g. "168h"
    #[serde(default, alias = "expires", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
}

/// Snapshot template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTemplateSpec {
    /// Labels added to every snapshot
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// VolumeSnapshotClass to use; the cluster default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class_name: Option<String>,
}

/// Status of a SnapshotSchedule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotScheduleStatus {
    /// Conditions
    #[serde(default)]
    pub conditions: Vec<ScheduleCondition>,

    /// Time of the most recent snapshot cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot_time: Option<DateTime<Utc>>,

    /// Time the next snapshot cycle becomes due
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_snapshot_time: Option<DateTime<Utc>>,
}

impl SnapshotScheduleStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&ScheduleCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Schedule condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time status or reason changed
    pub last_transition_time: DateTime<Utc>,
}

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Namespace-scoped identity of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScheduleId {
    pub namespace: String,
    pub name: String,
}

impl ScheduleId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&SnapshotSchedule> for ScheduleId {
    fn from(schedule: &SnapshotSchedule) -> Self {
        Self::new(schedule.namespace().unwrap_or_default(), schedule.name_any())
    }
}

// ============================================================================
// VolumeSnapshot (snapshot.storage.k8s.io), consumed from the CSI snapshotter
// ============================================================================

/// VolumeSnapshot requests a point-in-time copy of a PersistentVolumeClaim
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    status = "VolumeSnapshotStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Snapshot source
    pub source: VolumeSnapshotSource,

    /// VolumeSnapshotClass name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Snapshot source; exactly one field is set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

/// Status reported by the snapshot controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
}
