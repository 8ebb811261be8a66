//! Snapshot provisioning.
//!
//! Creates one snapshot per selected volume for a cycle. Snapshot names are a
//! pure function of (schedule, volume, cycle time), so repeating a cycle
//! after a crash finds the earlier snapshots instead of duplicating them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::crd::{SnapshotSchedule, VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use crate::error::{Result, SnapschedError};
use crate::selector::{schedule_label_value, SCHEDULE_ANNOTATION, SCHEDULE_LABEL, WHEN_LABEL};
use crate::store::ObjectStore;

/// Maximum length of a Kubernetes object name.
pub const MAX_NAME_LENGTH: usize = 253;

const HASH_LENGTH: usize = 8;

/// Format of the cycle time in snapshot names and the `when` label.
pub const CYCLE_FORMAT: &str = "%Y%m%d%H%M";

/// A per-item failure.
#[derive(Debug)]
pub struct ItemFailure {
    /// The volume or snapshot that failed.
    pub item: String,
    pub error: SnapschedError,
}

/// Result of one provisioning pass.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    /// Snapshots created by this pass.
    pub created: Vec<String>,
    /// Snapshots that already existed from an earlier attempt.
    pub existing: Vec<String>,
    /// Failures in volume order.
    pub failures: Vec<ItemFailure>,
}

impl ProvisionOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// First [`HASH_LENGTH`] hex digits of the SHA-256 of `input`.
pub(crate) fn short_hash(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .take(HASH_LENGTH / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Deterministic snapshot name for a volume and cycle.
///
/// Names over [`MAX_NAME_LENGTH`] keep the cycle suffix; the rest is cut
/// short and disambiguated with a hash of the full name.
pub fn snapshot_name(schedule: &str, volume: &str, cycle: DateTime<Utc>) -> String {
    let when = cycle.format(CYCLE_FORMAT).to_string();
    let full = format!("{}-{}-{}", schedule, volume, when);
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }

    let hash = short_hash(&full);

    let budget = MAX_NAME_LENGTH - when.len() - HASH_LENGTH - 2;
    let mut prefix: String = format!("{}-{}", schedule, volume)
        .chars()
        .take(budget)
        .collect();
    // Names must end alphanumeric before the next separator
    while prefix.ends_with(['-', '.']) {
        prefix.pop();
    }

    format!("{}-{}-{}", prefix, hash, when)
}

/// Build the snapshot object for `volume` in `cycle`.
pub fn build_snapshot(
    schedule: &SnapshotSchedule,
    volume: &str,
    cycle: DateTime<Utc>,
) -> VolumeSnapshot {
    let schedule_name = schedule.name_any();
    let template = schedule.spec.snapshot_template.clone().unwrap_or_default();

    let mut labels: BTreeMap<String, String> = template.labels;
    labels.insert(SCHEDULE_LABEL.to_string(), schedule_label_value(&schedule_name));
    labels.insert(
        WHEN_LABEL.to_string(),
        cycle.format(CYCLE_FORMAT).to_string(),
    );

    let mut snapshot = VolumeSnapshot::new(
        &snapshot_name(&schedule_name, volume, cycle),
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(volume.to_string()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: template.snapshot_class_name,
        },
    );
    snapshot.metadata.namespace = schedule.namespace();
    snapshot.metadata.labels = Some(labels);
    snapshot.metadata.annotations = Some(BTreeMap::from([(
        SCHEDULE_ANNOTATION.to_string(),
        schedule_name,
    )]));
    snapshot
}

/// Whether `existing` was taken by the same schedule of the same volume as
/// `desired`.
fn same_source(existing: &VolumeSnapshot, desired: &VolumeSnapshot) -> bool {
    existing.labels().get(SCHEDULE_LABEL) == desired.labels().get(SCHEDULE_LABEL)
        && existing.spec.source.persistent_volume_claim_name
            == desired.spec.source.persistent_volume_claim_name
}

enum Created {
    New,
    Existing,
}

/// Create `snapshot`, accepting an identical one left by an earlier attempt.
///
/// A same-named snapshot of another schedule or volume is an error.
async fn create_or_adopt<S: ObjectStore>(store: &S, snapshot: &VolumeSnapshot) -> Result<Created> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();

    match store.create_snapshot(snapshot).await {
        Ok(()) => Ok(Created::New),
        Err(SnapschedError::AlreadyExists(_)) => match store.get_snapshot(&namespace, &name).await? {
            Some(existing) if same_source(&existing, snapshot) => Ok(Created::Existing),
            Some(existing) => Err(SnapschedError::AlreadyExists(format!(
                "{}/{} belongs to schedule {} volume {}",
                namespace,
                name,
                existing
                    .labels()
                    .get(SCHEDULE_LABEL)
                    .map_or("<none>", String::as_str),
                existing
                    .spec
                    .source
                    .persistent_volume_claim_name
                    .as_deref()
                    .unwrap_or("<none>"),
            ))),
            // Deleted since the create was rejected
            None => store.create_snapshot(snapshot).await.map(|()| Created::New),
        },
        Err(e) => Err(e),
    }
}

/// Creates snapshots for a schedule's volumes.
pub struct Provisioner<S> {
    store: Arc<S>,
    limiter: Arc<Semaphore>,
}

impl<S: ObjectStore> Provisioner<S> {
    pub fn new(store: Arc<S>, max_concurrent: usize) -> Self {
        Self {
            store,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// List the volumes selected by `schedule`, ordered by name.
    pub async fn select_volumes(&self, schedule: &SnapshotSchedule) -> Result<Vec<PersistentVolumeClaim>> {
        let namespace = schedule.namespace().unwrap_or_default();
        let mut volumes = self
            .store
            .list_volumes(&namespace, &schedule.spec.volume_selector)
            .await?;
        volumes.sort_by_key(|v| v.name_any());
        debug!(
            schedule = %schedule.name_any(),
            namespace = %namespace,
            count = volumes.len(),
            "Selected volumes"
        );
        Ok(volumes)
    }

    /// Snapshot every volume for `cycle`.
    ///
    /// Volumes are processed independently; one failure never prevents the
    /// others. A snapshot that already exists counts as provisioned when it
    /// was taken by this schedule of the same volume.
    pub async fn provision(
        &self,
        schedule: &SnapshotSchedule,
        volumes: &[PersistentVolumeClaim],
        cycle: DateTime<Utc>,
    ) -> ProvisionOutcome {
        let creates: Vec<_> = volumes
            .iter()
            .map(|volume| {
                let volume = volume.name_any();
                let snapshot = build_snapshot(schedule, &volume, cycle);
                let store = Arc::clone(&self.store);
                let limiter = Arc::clone(&self.limiter);
                async move {
                    let result = match limiter.acquire().await {
                        Ok(_permit) => create_or_adopt(&*store, &snapshot).await,
                        Err(_) => Err(SnapschedError::Internal(
                            "provisioner limiter closed".to_string(),
                        )),
                    };
                    (volume, snapshot.name_any(), result)
                }
            })
            .collect();

        let results = futures::future::join_all(creates).await;

        let mut outcome = ProvisionOutcome::default();
        for (volume, name, result) in results {
            match result {
                Ok(Created::New) => {
                    debug!(snapshot = %name, volume = %volume, "Created snapshot");
                    outcome.created.push(name);
                }
                Ok(Created::Existing) => {
                    debug!(snapshot = %name, volume = %volume, "Snapshot already exists");
                    outcome.existing.push(name);
                }
                Err(error) => {
                    warn!(
                        schedule = %schedule.name_any(),
                        volume = %volume,
                        error = %error,
                        "Snapshot creation failed"
                    );
                    outcome.failures.push(ItemFailure {
                        item: volume,
                        error,
                    });
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SnapshotScheduleSpec, SnapshotTemplateSpec};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn cycle() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap()
    }

    fn schedule() -> SnapshotSchedule {
        let mut schedule = SnapshotSchedule::new(
            "hourly",
            SnapshotScheduleSpec {
                schedule_expression: Some("0 * * * *".to_string()),
                snapshot_template: Some(SnapshotTemplateSpec {
                    labels: BTreeMap::from([("tier".to_string(), "gold".to_string())]),
                    snapshot_class_name: Some("csi-snap".to_string()),
                }),
                ..Default::default()
            },
        );
        schedule.metadata.namespace = Some("apps".to_string());
        schedule
    }

    #[test]
    fn test_snapshot_name() {
        assert_eq!(
            snapshot_name("hourly", "data", cycle()),
            "hourly-data-202406011100"
        );
    }

    #[test]
    fn test_long_names_are_bounded_and_distinct() {
        let schedule = "s".repeat(100);
        let a = snapshot_name(&schedule, &format!("{}a", "v".repeat(200)), cycle());
        let b = snapshot_name(&schedule, &format!("{}b", "v".repeat(200)), cycle());

        assert!(a.len() <= MAX_NAME_LENGTH);
        assert!(b.len() <= MAX_NAME_LENGTH);
        assert_ne!(a, b);
        assert!(a.ends_with("-202406011100"));
        assert!(a.starts_with(&schedule));
        // Stable across calls
        assert_eq!(a, snapshot_name(&schedule, &format!("{}a", "v".repeat(200)), cycle()));
    }

    #[test]
    fn test_build_snapshot() {
        let snapshot = build_snapshot(&schedule(), "data", cycle());
        assert_eq!(snapshot.namespace().as_deref(), Some("apps"));
        assert_eq!(
            snapshot.spec.source.persistent_volume_claim_name.as_deref(),
            Some("data")
        );
        assert_eq!(
            snapshot.spec.volume_snapshot_class_name.as_deref(),
            Some("csi-snap")
        );
        let labels = snapshot.labels();
        assert_eq!(labels.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(labels.get(SCHEDULE_LABEL).map(String::as_str), Some("hourly"));
        assert_eq!(
            snapshot.annotations().get(SCHEDULE_ANNOTATION).map(String::as_str),
            Some("hourly")
        );
        assert_eq!(labels.get(WHEN_LABEL).map(String::as_str), Some("202406011100"));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.add_volume("apps", "data", &[]);
        store.add_volume("apps", "logs", &[]);
        let provisioner = Provisioner::new(Arc::clone(&store), 2);
        let schedule = schedule();

        let volumes = provisioner.select_volumes(&schedule).await.unwrap();
        let first = provisioner.provision(&schedule, &volumes, cycle()).await;
        assert_eq!(first.created.len(), 2);
        assert!(first.is_success());

        let second = provisioner.provision(&schedule, &volumes, cycle()).await;
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 2);
        assert_eq!(store.snapshots("apps").len(), 2);
    }

    #[tokio::test]
    async fn test_provision_isolates_failures() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b", "c"] {
            store.add_volume("apps", name, &[]);
        }
        store.fail_creates_for("b");
        let provisioner = Provisioner::new(Arc::clone(&store), 1);
        let schedule = schedule();

        let volumes = provisioner.select_volumes(&schedule).await.unwrap();
        let outcome = provisioner.provision(&schedule, &volumes, cycle()).await;
        assert_eq!(outcome.created.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item, "b");
    }

    #[tokio::test]
    async fn test_name_collision_with_other_schedule_fails() {
        let store = Arc::new(MemoryStore::new());
        store.add_volume("apps", "b-c", &[]);
        store.add_volume("apps", "c", &[]);
        let provisioner = Provisioner::new(Arc::clone(&store), 2);

        let mut a = schedule();
        a.metadata.name = Some("a".to_string());
        let mut a_b = schedule();
        a_b.metadata.name = Some("a-b".to_string());

        let b_c = provisioner.select_volumes(&a).await.unwrap();
        let b_c: Vec<_> = b_c.into_iter().filter(|v| v.name_any() == "b-c").collect();
        let first = provisioner.provision(&a, &b_c, cycle()).await;
        assert_eq!(first.created, vec!["a-b-c-202406011100"]);

        let c = provisioner.select_volumes(&a_b).await.unwrap();
        let c: Vec<_> = c.into_iter().filter(|v| v.name_any() == "c").collect();
        let second = provisioner.provision(&a_b, &c, cycle()).await;
        assert!(second.created.is_empty());
        assert!(second.existing.is_empty());
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].item, "c");
        assert!(second.failures[0].error.to_string().contains("belongs to schedule a volume b-c"));
    }

    #[tokio::test]
    async fn test_long_schedule_name_fits_label() {
        let store = Arc::new(MemoryStore::new());
        store.add_volume("apps", "data", &[]);
        let provisioner = Provisioner::new(Arc::clone(&store), 1);
        let name = "nightly-backup-".repeat(6) + "primary";
        let mut schedule = schedule();
        schedule.metadata.name = Some(name.clone());

        let volumes = provisioner.select_volumes(&schedule).await.unwrap();
        assert!(provisioner.provision(&schedule, &volumes, cycle()).await.is_success());

        let snapshot = &store.snapshots("apps")[0];
        let label = snapshot.labels().get(SCHEDULE_LABEL).cloned().unwrap_or_default();
        assert!(label.len() <= crate::selector::MAX_LABEL_VALUE_LENGTH);
        assert_eq!(label, schedule_label_value(&name));
        assert_eq!(snapshot.annotations().get(SCHEDULE_ANNOTATION), Some(&name));

        // Retrying the cycle still recognises the snapshot as its own
        let retry = provisioner.provision(&schedule, &volumes, cycle()).await;
        assert_eq!(retry.existing.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_selection_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Provisioner::new(Arc::clone(&store), 4);
        let schedule = schedule();

        let volumes = provisioner.select_volumes(&schedule).await.unwrap();
        assert!(volumes.is_empty());
        let outcome = provisioner.provision(&schedule, &volumes, cycle()).await;
        assert!(outcome.is_success());
        assert!(outcome.created.is_empty());
    }
}
