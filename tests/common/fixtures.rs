// Test fixtures and builders for integration tests

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};

use snapsched::crd::{
    RetentionSpec, SnapshotSchedule, SnapshotScheduleSpec, VolumeSnapshot, VolumeSnapshotSpec,
};
use snapsched::selector::{schedule_label_value, SCHEDULE_LABEL};

use super::NAMESPACE;

/// Build a UTC instant.
pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid fixture time")
}

/// Fluent builder for SnapshotSchedules
pub struct ScheduleBuilder {
    name: String,
    spec: SnapshotScheduleSpec,
}

impl ScheduleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            spec: SnapshotScheduleSpec {
                volume_selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                    match_expressions: None,
                },
                ..Default::default()
            },
        }
    }

    pub fn expression(mut self, expression: &str) -> Self {
        self.spec.schedule_expression = Some(expression.to_string());
        self
    }

    pub fn max_count(mut self, count: i32) -> Self {
        self.spec.retention.max_count = Some(count);
        self
    }

    pub fn max_age(mut self, age: &str) -> Self {
        self.spec.retention.max_age = Some(age.to_string());
        self
    }

    pub fn retention(mut self, retention: RetentionSpec) -> Self {
        self.spec.retention = retention;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.spec.disabled = true;
        self
    }

    pub fn build(self) -> SnapshotSchedule {
        let mut schedule = SnapshotSchedule::new(&self.name, self.spec);
        schedule.metadata.namespace = Some(NAMESPACE.to_string());
        schedule
    }
}

/// A snapshot owned by `schedule`, created at `created`.
pub fn owned_snapshot(schedule: &str, name: &str, created: DateTime<Utc>) -> VolumeSnapshot {
    let mut snapshot = VolumeSnapshot::new(name, VolumeSnapshotSpec::default());
    snapshot.metadata.namespace = Some(NAMESPACE.to_string());
    snapshot.metadata.creation_timestamp = Some(Time(created));
    snapshot.metadata.labels = Some(BTreeMap::from([(
        SCHEDULE_LABEL.to_string(),
        schedule_label_value(schedule),
    )]));
    snapshot
}
