//! Kubernetes API backend.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, instrument};

use super::ObjectStore;
use crate::crd::{ScheduleId, SnapshotSchedule, VolumeSnapshot};
use crate::error::{Result, SnapschedError};
use crate::selector;

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn list_params(selector: &LabelSelector) -> Result<ListParams> {
        let selector = selector::parse(selector)?;
        let params = ListParams::default();
        Ok(if selector.selects_all() {
            params
        } else {
            params.labels_from(&selector)
        })
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<SnapshotSchedule>> {
        let api: Api<SnapshotSchedule> = Api::namespaced(self.client.clone(), &id.namespace);
        Ok(api.get_opt(&id.name).await?)
    }

    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&Self::list_params(selector)?).await?;
        Ok(list.items)
    }

    async fn list_snapshots(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<VolumeSnapshot>> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&Self::list_params(selector)?).await?;
        Ok(list.items)
    }

    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, snapshot), fields(name = %snapshot.name_any()))]
    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<()> {
        let namespace = snapshot.namespace().ok_or_else(|| {
            SnapschedError::Internal(format!("snapshot {} has no namespace", snapshot.name_any()))
        })?;
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };

        match api.create(&params, snapshot).await {
            Ok(_) => {
                debug!("Created snapshot");
                Ok(())
            }
            Err(e) if api_code(&e) == Some(409) => Err(SnapschedError::AlreadyExists(format!(
                "{}/{}",
                namespace,
                snapshot.name_any()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(404) => {
                Err(SnapschedError::NotFound(format!("{}/{}", namespace, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_schedule_status(
        &self,
        schedule: &SnapshotSchedule,
    ) -> Result<SnapshotSchedule> {
        let id = ScheduleId::from(schedule);
        let api: Api<SnapshotSchedule> = Api::namespaced(self.client.clone(), &id.namespace);

        // A merge patch carrying resourceVersion is rejected with 409 when stale
        let patch = json!({
            "metadata": { "resourceVersion": schedule.resource_version() },
            "status": schedule.status,
        });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };

        match api.patch_status(&id.name, &params, &Patch::Merge(&patch)).await {
            Ok(updated) => Ok(updated),
            Err(e) if api_code(&e) == Some(409) => Err(SnapschedError::Conflict(id.to_string())),
            Err(e) if api_code(&e) == Some(404) => Err(SnapschedError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
