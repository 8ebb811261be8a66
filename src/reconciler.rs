//! Schedule reconciliation.
//!
//! One reconcile pass for one schedule: decide whether a snapshot cycle is
//! due, provision it, enforce retention, persist status and report when the
//! schedule next needs attention. All durable state lives in the schedule's
//! status; the reconciler itself is stateless between passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReconcilerConfig;
use crate::crd::{ScheduleId, SnapshotSchedule};
use crate::error::{Result, SnapschedError};
use crate::provisioner::Provisioner;
use crate::retention::{self, RetentionPolicy, SnapshotRecord};
use crate::scheduling::{next_after, parse_schedule, CronExpr};
use crate::selector::schedule_selector;
use crate::status::{self, CycleOutcome, Failure, FailureKind};
use crate::store::ObjectStore;

/// What happened during a pass, for logging and metrics.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// A snapshot cycle was due and attempted.
    pub due: bool,
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<Failure>,
}

/// Result of reconciling one schedule.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// When to reconcile again; `None` waits for the next change.
    pub requeue_after: Option<Duration>,
    /// Error that stopped the pass, if any.
    pub error: Option<SnapschedError>,
    pub report: CycleReport,
}

impl ReconcileOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

struct Pass {
    report: CycleReport,
    requeue_after: Option<Duration>,
}

/// Drives snapshot schedules toward their desired state.
pub struct ScheduleReconciler<S> {
    store: Arc<S>,
    provisioner: Provisioner<S>,
    config: ReconcilerConfig,
}

impl<S: ObjectStore> ScheduleReconciler<S> {
    pub fn new(store: Arc<S>, config: ReconcilerConfig) -> Self {
        let provisioner = Provisioner::new(Arc::clone(&store), config.max_concurrent_operations);
        Self {
            store,
            provisioner,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile `id` against the wall clock.
    pub async fn reconcile(&self, id: &ScheduleId) -> ReconcileOutcome {
        self.reconcile_at(id, Utc::now()).await
    }

    /// Reconcile `id` as of `now`.
    #[instrument(skip(self, id, now), fields(schedule = %id))]
    pub async fn reconcile_at(&self, id: &ScheduleId, now: DateTime<Utc>) -> ReconcileOutcome {
        let result = tokio::time::timeout(self.config.reconcile_timeout, self.run(id, now)).await;

        let error = match result {
            Ok(Ok(Some(pass))) => {
                return ReconcileOutcome {
                    requeue_after: pass.requeue_after,
                    error: None,
                    report: pass.report,
                }
            }
            Ok(Ok(None)) => return ReconcileOutcome::default(),
            Ok(Err(e)) => e,
            Err(_) => SnapschedError::Timeout(timeout_millis(self.config.reconcile_timeout)),
        };

        error!(error = %error, retryable = error.is_retryable(), "Reconcile failed");
        ReconcileOutcome {
            requeue_after: Some(self.config.error_backoff),
            error: Some(error),
            report: CycleReport::default(),
        }
    }

    async fn run(&self, id: &ScheduleId, now: DateTime<Utc>) -> Result<Option<Pass>> {
        let Some(schedule) = self.store.get_schedule(id).await? else {
            debug!("Schedule not found, nothing to do");
            return Ok(None);
        };

        let mut cycle = CycleOutcome::default();
        let mut report = CycleReport::default();

        let expression = schedule
            .spec
            .schedule_expression
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());

        match expression {
            Some(_) if schedule.spec.disabled => {
                debug!("Scheduling disabled");
                cycle.scheduling_disabled = true;
            }
            None => {
                debug!("No schedule expression");
                cycle.scheduling_disabled = true;
            }
            Some(expression) => match parse_schedule(expression) {
                Ok(cron) => {
                    self.advance(&schedule, &cron, now, &mut cycle, &mut report)
                        .await
                }
                Err(e) => {
                    warn!(expression = %expression, error = %e, "Malformed schedule");
                    cycle.fail(FailureKind::MalformedSchedule, e.to_string());
                }
            },
        }

        let expiry = self.enforce_retention(&schedule, now, &mut cycle, &mut report).await;

        report.failures = cycle.failures.clone();
        self.persist_status(schedule, &cycle, now).await?;

        let wake = [cycle.next_snapshot_time, expiry].into_iter().flatten().min();
        let requeue_after = wake.map(|at| {
            (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(self.config.min_requeue)
        });

        info!(
            due = report.due,
            created = report.created.len(),
            deleted = report.deleted.len(),
            failures = report.failures.len(),
            next = ?cycle.next_snapshot_time,
            requeue_secs = requeue_after.map(|d| d.as_secs()),
            "Reconciled schedule"
        );

        Ok(Some(Pass {
            report,
            requeue_after,
        }))
    }

    /// Due check and, when due, one snapshot cycle.
    async fn advance(
        &self,
        schedule: &SnapshotSchedule,
        cron: &CronExpr,
        now: DateTime<Utc>,
        cycle: &mut CycleOutcome,
        report: &mut CycleReport,
    ) {
        let upcoming = match next_after(cron, now) {
            Ok(upcoming) => Some(upcoming),
            Err(e) => {
                cycle.fail(FailureKind::NotScheduled, e.to_string());
                None
            }
        };

        let stored = schedule
            .status
            .as_ref()
            .and_then(|s| s.next_snapshot_time)
            .filter(|next| cron.matches(next))
            .filter(|next| upcoming.map_or(true, |upcoming| *next <= upcoming));

        let due_at = match stored {
            Some(next) if now >= next => next,
            Some(next) => {
                cycle.next_snapshot_time = Some(next);
                return;
            }
            None => {
                info!(next = ?upcoming, "Seeding next snapshot time");
                cycle.next_snapshot_time = upcoming;
                return;
            }
        };

        report.due = true;
        info!(cycle = %due_at, "Snapshot cycle due");

        match self.provisioner.select_volumes(schedule).await {
            Ok(volumes) => {
                let outcome = self.provisioner.provision(schedule, &volumes, due_at).await;
                for failure in &outcome.failures {
                    cycle.fail(
                        FailureKind::SnapshotCreateFailed,
                        format!("{}: {}", failure.item, failure.error),
                    );
                }
                report.created = outcome.created;
                report.existing = outcome.existing;
            }
            Err(e) => {
                warn!(error = %e, "Listing volumes failed");
                cycle.fail(FailureKind::VolumeListFailed, e.to_string());
            }
        }

        // Skip missed runs: the next cycle is computed from now
        cycle.last_snapshot_time = Some(now);
        cycle.next_snapshot_time = upcoming;
    }

    /// Delete snapshots outside the retention policy, returning the earliest
    /// upcoming age expiry among the survivors.
    async fn enforce_retention(
        &self,
        schedule: &SnapshotSchedule,
        now: DateTime<Utc>,
        cycle: &mut CycleOutcome,
        report: &mut CycleReport,
    ) -> Option<DateTime<Utc>> {
        let policy = match RetentionPolicy::from_spec(&schedule.spec.retention) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "Invalid retention policy");
                cycle.fail(FailureKind::InvalidRetention, e.to_string());
                return None;
            }
        };
        if policy.is_disabled() {
            return None;
        }

        let namespace = schedule.namespace().unwrap_or_default();
        let snapshots = match self
            .store
            .list_snapshots(&namespace, &schedule_selector(&schedule.name_any()))
            .await
        {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "Listing snapshots failed");
                cycle.fail(FailureKind::SnapshotListFailed, e.to_string());
                return None;
            }
        };

        let records: Vec<SnapshotRecord> = snapshots.iter().map(SnapshotRecord::from).collect();
        let plan = retention::plan(&records, &policy, now);

        let mut survivors: Vec<SnapshotRecord> = records
            .iter()
            .filter(|r| !plan.contains_key(&r.name))
            .cloned()
            .collect();

        for (name, reason) in plan {
            match self.store.delete_snapshot(&namespace, &name).await {
                Ok(()) => {
                    info!(snapshot = %name, reason = ?reason, "Deleted snapshot");
                    report.deleted.push(name);
                }
                Err(e) if e.is_not_found() => {
                    debug!(snapshot = %name, "Snapshot already deleted");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "Snapshot deletion failed");
                    cycle.fail(FailureKind::SnapshotDeleteFailed, format!("{}: {}", name, e));
                    if let Some(record) = records.iter().find(|r| r.name == name) {
                        survivors.push(record.clone());
                    }
                }
            }
        }

        retention::next_expiry(&survivors, &policy, now)
    }

    /// Persist the outcome, re-reading the schedule on write conflicts.
    async fn persist_status(
        &self,
        schedule: SnapshotSchedule,
        cycle: &CycleOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = ScheduleId::from(&schedule);
        let mut current = schedule;
        let mut attempt = 0;

        loop {
            let desired = status::apply_outcome(current.status.as_ref(), cycle, now);
            if current.status.as_ref() == Some(&desired) {
                debug!("Status unchanged");
                return Ok(());
            }

            let mut updated = current.clone();
            updated.status = Some(desired);

            match self.store.update_schedule_status(&updated).await {
                Ok(_) => return Ok(()),
                Err(SnapschedError::Conflict(_)) if attempt < self.config.status_update_retries => {
                    attempt += 1;
                    debug!(attempt, "Status update conflict, re-reading schedule");
                    match self.store.get_schedule(&id).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!("Schedule deleted before status update");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
fn timeout_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RetentionSpec, SnapshotScheduleSpec, SnapshotScheduleStatus};
    use crate::status::{CONDITION_FAILED, CONDITION_SCHEDULING_DISABLED};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    fn setup(spec: SnapshotScheduleSpec) -> (Arc<MemoryStore>, ScheduleReconciler<MemoryStore>, ScheduleId) {
        let store = Arc::new(MemoryStore::new());
        let mut schedule = SnapshotSchedule::new("hourly", spec);
        schedule.metadata.namespace = Some("apps".to_string());
        store.add_schedule(schedule);
        store.add_volume("apps", "data", &[]);
        let reconciler = ScheduleReconciler::new(Arc::clone(&store), ReconcilerConfig::default());
        (store, reconciler, ScheduleId::new("apps", "hourly"))
    }

    fn hourly() -> SnapshotScheduleSpec {
        SnapshotScheduleSpec {
            schedule_expression: Some("0 * * * *".to_string()),
            ..Default::default()
        }
    }

    fn status(store: &MemoryStore, id: &ScheduleId) -> SnapshotScheduleStatus {
        store.schedule(id).and_then(|s| s.status).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_first_reconcile_seeds_next_time() {
        let (store, reconciler, id) = setup(hourly());

        let outcome = reconciler.reconcile_at(&id, at(10, 15)).await;
        assert!(!outcome.is_error());
        assert!(!outcome.report.due);
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(45 * 60)));
        assert_eq!(status(&store, &id).next_snapshot_time, Some(at(11, 0)));
        assert!(store.snapshots("apps").is_empty());
    }

    #[tokio::test]
    async fn test_due_cycle_creates_snapshots() {
        let (store, reconciler, id) = setup(hourly());
        reconciler.reconcile_at(&id, at(10, 15)).await;

        store.set_now(at(11, 5));
        let outcome = reconciler.reconcile_at(&id, at(11, 5)).await;
        assert!(outcome.report.due);
        assert_eq!(outcome.report.created, vec!["hourly-data-202406011100"]);

        let status = status(&store, &id);
        assert_eq!(status.last_snapshot_time, Some(at(11, 5)));
        assert_eq!(status.next_snapshot_time, Some(at(12, 0)));
    }

    #[tokio::test]
    async fn test_missing_schedule_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = ScheduleReconciler::new(Arc::clone(&store), ReconcilerConfig::default());
        let outcome = reconciler
            .reconcile_at(&ScheduleId::new("apps", "gone"), at(10, 0))
            .await;
        assert!(!outcome.is_error());
        assert!(outcome.requeue_after.is_none());
    }

    #[tokio::test]
    async fn test_disabled_schedule() {
        let (store, reconciler, id) = setup(SnapshotScheduleSpec {
            disabled: true,
            ..hourly()
        });

        let outcome = reconciler.reconcile_at(&id, at(10, 15)).await;
        assert!(outcome.requeue_after.is_none());
        let status = status(&store, &id);
        assert!(status.next_snapshot_time.is_none());
        assert_eq!(
            status.condition(CONDITION_SCHEDULING_DISABLED).unwrap().status,
            crate::crd::ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn test_malformed_schedule_surfaces_condition() {
        let (store, reconciler, id) = setup(SnapshotScheduleSpec {
            schedule_expression: Some("61 * * * *".to_string()),
            ..Default::default()
        });

        let outcome = reconciler.reconcile_at(&id, at(10, 15)).await;
        assert!(!outcome.is_error());
        let status = status(&store, &id);
        assert_eq!(status.condition(CONDITION_FAILED).unwrap().reason, "MalformedSchedule");
        assert!(status.next_snapshot_time.is_none());
    }

    #[tokio::test]
    async fn test_invalid_retention_surfaces_condition() {
        let (store, reconciler, id) = setup(SnapshotScheduleSpec {
            retention: RetentionSpec {
                max_count: Some(0),
                max_age: None,
            },
            ..hourly()
        });

        reconciler.reconcile_at(&id, at(10, 15)).await;
        let status = status(&store, &id);
        assert_eq!(status.condition(CONDITION_FAILED).unwrap().reason, "InvalidRetention");
        assert_eq!(status.next_snapshot_time, Some(at(11, 0)));
    }

    #[test]
    fn test_timeout_millis_saturates() {
        assert_eq!(timeout_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(timeout_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_rewritten() {
        let (store, reconciler, id) = setup(hourly());
        reconciler.reconcile_at(&id, at(10, 15)).await;
        reconciler.reconcile_at(&id, at(10, 20)).await;
        assert_eq!(store.status_writes(), 1);
    }
}
