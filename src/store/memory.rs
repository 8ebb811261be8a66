//! In-memory backend with fault injection.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::ResourceExt;
use parking_lot::Mutex;

use super::ObjectStore;
use crate::crd::{ScheduleId, SnapshotSchedule, VolumeSnapshot};
use crate::error::{Result, SnapschedError};
use crate::selector;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    schedules: BTreeMap<Key, SnapshotSchedule>,
    volumes: BTreeMap<Key, PersistentVolumeClaim>,
    snapshots: BTreeMap<Key, VolumeSnapshot>,
    resource_version: u64,
    now: Option<DateTime<Utc>>,

    failing_volumes: BTreeSet<String>,
    failing_deletes: BTreeSet<String>,
    vanishing: BTreeSet<String>,
    fail_volume_list: bool,
    fail_snapshot_list: bool,
    pending_conflicts: u32,
    create_calls: usize,
    delete_calls: usize,
    status_writes: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Store that keeps all objects in process.
///
/// Creation timestamps come from the clock set with [`MemoryStore::set_now`],
/// falling back to the wall clock.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the clock used to stamp created objects.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state.lock().now = Some(now);
    }

    fn now(state: &State) -> DateTime<Utc> {
        state.now.unwrap_or_else(Utc::now)
    }

    /// Insert or replace a schedule, bumping its resource version.
    pub fn add_schedule(&self, mut schedule: SnapshotSchedule) -> SnapshotSchedule {
        let mut state = self.state.lock();
        let namespace = schedule.namespace().unwrap_or_default();
        schedule.metadata.namespace = Some(namespace.clone());
        schedule.metadata.resource_version = Some(state.next_version());
        if schedule.metadata.creation_timestamp.is_none() {
            schedule.metadata.creation_timestamp = Some(Time(Self::now(&state)));
        }
        state
            .schedules
            .insert(key(&namespace, &schedule.name_any()), schedule.clone());
        schedule
    }

    /// Replace a schedule's spec, keeping its status.
    pub fn update_schedule_spec(
        &self,
        id: &ScheduleId,
        update: impl FnOnce(&mut SnapshotSchedule),
    ) -> Result<SnapshotSchedule> {
        let mut state = self.state.lock();
        let version = state.next_version();
        let schedule = state
            .schedules
            .get_mut(&key(&id.namespace, &id.name))
            .ok_or_else(|| SnapschedError::NotFound(id.to_string()))?;
        update(schedule);
        schedule.metadata.resource_version = Some(version);
        Ok(schedule.clone())
    }

    pub fn remove_schedule(&self, id: &ScheduleId) -> Option<SnapshotSchedule> {
        self.state
            .lock()
            .schedules
            .remove(&key(&id.namespace, &id.name))
    }

    pub fn schedule(&self, id: &ScheduleId) -> Option<SnapshotSchedule> {
        self.state
            .lock()
            .schedules
            .get(&key(&id.namespace, &id.name))
            .cloned()
    }

    pub fn add_volume(&self, namespace: &str, name: &str, labels: &[(&str, &str)]) {
        let mut volume = PersistentVolumeClaim::default();
        volume.metadata.name = Some(name.to_string());
        volume.metadata.namespace = Some(namespace.to_string());
        volume.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self.state.lock().volumes.insert(key(namespace, name), volume);
    }

    /// Insert a snapshot as-is, bypassing creation bookkeeping.
    pub fn insert_snapshot(&self, snapshot: VolumeSnapshot) {
        let namespace = snapshot.namespace().unwrap_or_default();
        self.state
            .lock()
            .snapshots
            .insert(key(&namespace, &snapshot.name_any()), snapshot);
    }

    pub fn snapshots(&self, namespace: &str) -> Vec<VolumeSnapshot> {
        self.state
            .lock()
            .snapshots
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn snapshot_names(&self, namespace: &str) -> Vec<String> {
        self.snapshots(namespace)
            .iter()
            .map(|s| s.name_any())
            .collect()
    }

    /// Fail every snapshot creation whose source is `volume`.
    pub fn fail_creates_for(&self, volume: &str) {
        self.state.lock().failing_volumes.insert(volume.to_string());
    }

    pub fn clear_create_failures(&self) {
        self.state.lock().failing_volumes.clear();
    }

    /// Fail every deletion of the snapshot called `name`.
    pub fn fail_deletes_for(&self, name: &str) {
        self.state.lock().failing_deletes.insert(name.to_string());
    }

    /// Remove the snapshot called `name` right after the next list returns
    /// it, as a concurrent deleter would.
    pub fn vanish_after_list(&self, name: &str) {
        self.state.lock().vanishing.insert(name.to_string());
    }

    pub fn fail_volume_list(&self, fail: bool) {
        self.state.lock().fail_volume_list = fail;
    }

    pub fn fail_snapshot_list(&self, fail: bool) {
        self.state.lock().fail_snapshot_list = fail;
    }

    /// Reject the next `count` status writes with a conflict, bumping the
    /// stored version each time as a concurrent writer would.
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().pending_conflicts = count;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().status_writes
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<SnapshotSchedule>> {
        self.delay().await;
        Ok(self.schedule(id))
    }

    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        self.delay().await;
        let state = self.state.lock();
        if state.fail_volume_list {
            return Err(SnapschedError::ExternalOperationFailed(
                "volume list unavailable".to_string(),
            ));
        }

        let mut volumes = Vec::new();
        for ((ns, _), volume) in &state.volumes {
            if ns == namespace && selector::matches(selector, volume.labels())? {
                volumes.push(volume.clone());
            }
        }
        Ok(volumes)
    }

    async fn list_snapshots(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<VolumeSnapshot>> {
        self.delay().await;
        let mut state = self.state.lock();
        if state.fail_snapshot_list {
            return Err(SnapschedError::ExternalOperationFailed(
                "snapshot list unavailable".to_string(),
            ));
        }

        let mut snapshots = Vec::new();
        for ((ns, _), snapshot) in &state.snapshots {
            if ns == namespace && selector::matches(selector, snapshot.labels())? {
                snapshots.push(snapshot.clone());
            }
        }

        for name in std::mem::take(&mut state.vanishing) {
            state.snapshots.remove(&key(namespace, &name));
        }
        Ok(snapshots)
    }

    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>> {
        self.delay().await;
        Ok(self
            .state
            .lock()
            .snapshots
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.create_calls += 1;

        let namespace = snapshot.namespace().unwrap_or_default();
        let name = snapshot.name_any();
        let source = snapshot
            .spec
            .source
            .persistent_volume_claim_name
            .clone()
            .unwrap_or_default();

        if state.failing_volumes.contains(&source) {
            return Err(SnapschedError::ExternalOperationFailed(format!(
                "snapshot of {}/{} rejected",
                namespace, source
            )));
        }

        let k = key(&namespace, &name);
        if state.snapshots.contains_key(&k) {
            return Err(SnapschedError::AlreadyExists(format!("{}/{}", namespace, name)));
        }

        let mut stored = snapshot.clone();
        stored.metadata.creation_timestamp = Some(Time(Self::now(&state)));
        stored.metadata.resource_version = Some(state.next_version());
        state.snapshots.insert(k, stored);
        Ok(())
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.delay().await;
        let mut state = self.state.lock();
        state.delete_calls += 1;

        if state.failing_deletes.contains(name) {
            return Err(SnapschedError::ExternalOperationFailed(format!(
                "delete of {}/{} rejected",
                namespace, name
            )));
        }

        state
            .snapshots
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| SnapschedError::NotFound(format!("{}/{}", namespace, name)))
    }

    async fn update_schedule_status(
        &self,
        schedule: &SnapshotSchedule,
    ) -> Result<SnapshotSchedule> {
        self.delay().await;
        let id = ScheduleId::from(schedule);
        let mut state = self.state.lock();

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            let version = state.next_version();
            if let Some(stored) = state.schedules.get_mut(&key(&id.namespace, &id.name)) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(SnapschedError::Conflict(id.to_string()));
        }

        let version = state.next_version();
        let stored = state
            .schedules
            .get_mut(&key(&id.namespace, &id.name))
            .ok_or_else(|| SnapschedError::NotFound(id.to_string()))?;

        if stored.metadata.resource_version != schedule.metadata.resource_version {
            return Err(SnapschedError::Conflict(id.to_string()));
        }

        stored.status = schedule.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }
}
