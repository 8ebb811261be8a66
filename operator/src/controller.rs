//! Kubernetes controller for SnapshotSchedules

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

use snapsched::config::ReconcilerConfig;
use snapsched::crd::{ScheduleId, SnapshotSchedule, VolumeSnapshot};
use snapsched::reconciler::ScheduleReconciler;
use snapsched::selector::{SCHEDULE_ANNOTATION, SCHEDULE_LABEL};
use snapsched::store::KubeStore;

use crate::error::Error;
use crate::metrics;

/// Shared state handed to every reconcile
pub struct Context {
    reconciler: ScheduleReconciler<KubeStore>,
}

/// Main controller for SnapshotSchedule resources
pub struct Controller {
    client: Client,
    namespace: String,
    context: Arc<Context>,
}

impl Controller {
    /// Create a new controller
    pub async fn new(namespace: String, config: ReconcilerConfig) -> Result<Self, Error> {
        let client = Client::try_default().await?;
        let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));

        Ok(Self {
            client,
            namespace,
            context: Arc::new(Context {
                reconciler: ScheduleReconciler::new(store, config),
            }),
        })
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    /// Run the controller
    pub async fn run(&self) -> Result<(), Error> {
        info!("Starting snapshot schedule controller");

        let schedules: Api<SnapshotSchedule> = self.api();
        let snapshots: Api<VolumeSnapshot> = self.api();

        // Verify CRD is installed
        let lp = ListParams::default().limit(1);
        if let Err(e) = schedules.list(&lp).await {
            error!("Failed to list SnapshotSchedules. Is the CRD installed? Error: {}", e);
            return Err(Error::CrdNotInstalled);
        }

        info!("CRD verification successful");

        // Snapshot changes wake the schedule that owns them
        KubeController::new(schedules, Config::default())
            .watches(
                snapshots,
                Config::default().labels(SCHEDULE_LABEL),
                |snapshot: VolumeSnapshot| {
                    // The label may carry a shortened name
                    let schedule = snapshot
                        .annotations()
                        .get(SCHEDULE_ANNOTATION)
                        .or_else(|| snapshot.labels().get(SCHEDULE_LABEL))?
                        .clone();
                    let namespace = snapshot.namespace()?;
                    Some(ObjectRef::<SnapshotSchedule>::new(&schedule).within(&namespace))
                },
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.context))
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(
                            name = %obj.name,
                            ?action,
                            "Reconciliation successful"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation error");
                    }
                }
            })
            .await;

        info!("Controller stopped");
        Ok(())
    }
}

/// Reconcile a SnapshotSchedule resource
async fn reconcile(schedule: Arc<SnapshotSchedule>, ctx: Arc<Context>) -> Result<Action, Error> {
    let id = ScheduleId::from(schedule.as_ref());
    debug!(schedule = %id, "Reconciling SnapshotSchedule");

    let start = Instant::now();
    let outcome = ctx.reconciler.reconcile(&id).await;
    metrics::record_reconciliation(
        &id.namespace,
        !outcome.is_error(),
        start.elapsed().as_secs_f64(),
        &outcome.report,
    );

    if let Some(e) = outcome.error {
        return Err(e.into());
    }

    Ok(match outcome.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Error policy for reconciliation failures
fn error_policy(schedule: Arc<SnapshotSchedule>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(name = %schedule.name_any(), error = %error, "Reconciliation error, will retry");
    Action::requeue(ctx.reconciler.config().error_backoff)
}
