//! Retention policy enforcement.
//!
//! Decides which of a schedule's snapshots must be deleted. Two independent
//! ceilings exist, a maximum count and a maximum age; a snapshot exceeding
//! either one is deleted. Evaluation is pure and the caller performs the
//! deletions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::config::parse_duration;
use crate::crd::{RetentionSpec, VolumeSnapshot};
use crate::error::{Result, SnapschedError};

/// Reason for retention-based deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionReason {
    /// Ranked beyond the maximum count.
    CountExceeded { rank: usize, max: usize },
    /// Older than the maximum age.
    AgeExceeded,
}

/// Validated retention policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of snapshots to keep.
    pub max_count: Option<usize>,
    /// Maximum snapshot age.
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    /// Keep the newest `count` snapshots.
    pub fn keep_count(count: usize) -> Self {
        Self {
            max_count: Some(count),
            max_age: None,
        }
    }

    /// Keep snapshots younger than `age`.
    pub fn keep_for(age: Duration) -> Self {
        Self {
            max_count: None,
            max_age: Some(age),
        }
    }

    /// Build a policy from the user-facing spec.
    pub fn from_spec(spec: &RetentionSpec) -> Result<Self> {
        let max_count = match spec.max_count {
            None => None,
            Some(count) if count >= 1 => Some(count as usize),
            Some(count) => {
                return Err(SnapschedError::InvalidConfig {
                    field: "retention.maxCount".to_string(),
                    reason: format!("must be a positive integer, got {}", count),
                })
            }
        };

        let max_age = match spec.max_age.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let age = parse_duration(raw)?;
                let age = Duration::from_std(age).map_err(|_| SnapschedError::InvalidDuration {
                    input: raw.to_string(),
                    reason: "duration out of range".to_string(),
                })?;
                Some(age)
            }
        };

        Ok(Self { max_count, max_age })
    }

    /// Whether the policy prunes nothing.
    pub fn is_disabled(&self) -> bool {
        self.max_count.is_none() && self.max_age.is_none()
    }
}

/// The retention-relevant view of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Snapshot name, unique within the schedule's namespace.
    pub name: String,
    /// Creation time assigned by the store; `None` until stamped.
    pub created: Option<DateTime<Utc>>,
}

impl SnapshotRecord {
    pub fn new(name: impl Into<String>, created: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            created,
        }
    }
}

impl From<&VolumeSnapshot> for SnapshotRecord {
    fn from(snapshot: &VolumeSnapshot) -> Self {
        Self {
            name: snapshot.name_any(),
            created: snapshot.metadata.creation_timestamp.as_ref().map(|t| t.0),
        }
    }
}

/// Newest first; unstamped snapshots rank as newest; ties by name ascending.
fn newest_first(a: &SnapshotRecord, b: &SnapshotRecord) -> Ordering {
    match (a.created, b.created) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    }
    .then_with(|| a.name.cmp(&b.name))
}

fn is_expired(record: &SnapshotRecord, max_age: Duration, now: DateTime<Utc>) -> bool {
    record.created.is_some_and(|created| now - created > max_age)
}

/// Decide which snapshots to delete and why.
///
/// A snapshot matched by both rules is reported with its count reason.
pub fn plan(
    snapshots: &[SnapshotRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> BTreeMap<String, RetentionReason> {
    let mut deletions = BTreeMap::new();

    if let Some(max) = policy.max_count {
        let mut ranked: Vec<&SnapshotRecord> = snapshots.iter().collect();
        ranked.sort_by(|a, b| newest_first(a, b));
        for (rank, record) in ranked.into_iter().enumerate().skip(max) {
            deletions.insert(
                record.name.clone(),
                RetentionReason::CountExceeded { rank, max },
            );
        }
    }

    if let Some(max_age) = policy.max_age {
        for record in snapshots.iter().filter(|r| is_expired(r, max_age, now)) {
            deletions
                .entry(record.name.clone())
                .or_insert(RetentionReason::AgeExceeded);
        }
    }

    deletions
}

/// Compute the names of the snapshots to delete.
pub fn compute_deletions(
    snapshots: &[SnapshotRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    plan(snapshots, policy, now).into_keys().collect()
}

/// Earliest instant after `now` at which one of `snapshots` exceeds `max_age`.
pub fn next_expiry(
    snapshots: &[SnapshotRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let max_age = policy.max_age?;
    snapshots
        .iter()
        .filter_map(|r| r.created)
        .map(|created| created + max_age)
        .filter(|expiry| *expiry >= now)
        .min()
}
