//! Object store abstraction.
//!
//! The reconciler talks to the cluster only through [`ObjectStore`]. The
//! [`KubeStore`] backend drives a live API server; [`MemoryStore`] keeps
//! everything in process and supports fault injection for tests.

mod kube;
mod memory;

pub use self::kube::KubeStore;
pub use self::memory::MemoryStore;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::crd::{ScheduleId, SnapshotSchedule, VolumeSnapshot};
use crate::error::Result;

/// Access to schedules, volumes and snapshots.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a schedule by identity.
    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<SnapshotSchedule>>;

    /// List the volumes in `namespace` matching `selector`.
    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// List the snapshots in `namespace` matching `selector`.
    async fn list_snapshots(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<VolumeSnapshot>>;

    /// Get a snapshot by name.
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>>;

    /// Create a snapshot.
    ///
    /// Fails with [`AlreadyExists`](crate::error::SnapschedError::AlreadyExists)
    /// when a snapshot of the same name is present.
    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<()>;

    /// Delete a snapshot.
    ///
    /// Fails with [`NotFound`](crate::error::SnapschedError::NotFound) when
    /// the snapshot is already gone.
    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write a schedule's status.
    ///
    /// The write is conditional on the resource version carried by
    /// `schedule`; a stale version fails with
    /// [`Conflict`](crate::error::SnapschedError::Conflict).
    async fn update_schedule_status(&self, schedule: &SnapshotSchedule)
        -> Result<SnapshotSchedule>;
}
