//! Common test utilities for integration tests.

pub mod assertions;
pub mod fixtures;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use snapsched::config::ReconcilerConfig;
use snapsched::crd::{ScheduleId, SnapshotSchedule, SnapshotScheduleStatus};
use snapsched::reconciler::{ReconcileOutcome, ScheduleReconciler};
use snapsched::store::MemoryStore;

// Re-export common types
pub use assertions::*;
pub use fixtures::*;

/// Namespace used by all harness fixtures.
pub const NAMESPACE: &str = "apps";

/// A schedule under test, backed by an in-memory store.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub reconciler: ScheduleReconciler<MemoryStore>,
    pub id: ScheduleId,
}

impl TestHarness {
    pub fn new(schedule: SnapshotSchedule) -> Self {
        Self::with_config(schedule, ReconcilerConfig::default())
    }

    pub fn with_config(schedule: SnapshotSchedule, config: ReconcilerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let stored = store.add_schedule(schedule);
        let reconciler = ScheduleReconciler::new(Arc::clone(&store), config);
        Self {
            store,
            reconciler,
            id: ScheduleId::from(&stored),
        }
    }

    /// Add volumes labelled `app=db`.
    pub fn with_volumes(self, names: &[&str]) -> Self {
        for name in names {
            self.store.add_volume(NAMESPACE, name, &[("app", "db")]);
        }
        self
    }

    /// Add another schedule sharing the harness store.
    pub fn add_schedule(&self, schedule: SnapshotSchedule) -> ScheduleId {
        ScheduleId::from(&self.store.add_schedule(schedule))
    }

    /// Reconcile with both the reconciler and the store clock at `now`.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> ReconcileOutcome {
        self.reconcile_schedule_at(&self.id, now).await
    }

    pub async fn reconcile_schedule_at(&self, id: &ScheduleId, now: DateTime<Utc>) -> ReconcileOutcome {
        self.store.set_now(now);
        self.reconciler.reconcile_at(id, now).await
    }

    pub fn status(&self) -> SnapshotScheduleStatus {
        self.status_of(&self.id)
    }

    pub fn status_of(&self, id: &ScheduleId) -> SnapshotScheduleStatus {
        self.store
            .schedule(id)
            .and_then(|s| s.status)
            .unwrap_or_default()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names = self.store.snapshot_names(NAMESPACE);
        names.sort();
        names
    }
}
