//! Kubernetes-backed metadata collaborator
//!
//! Repository objects are typed; Snapshot objects are owned by the backup
//! tooling and only touched through `DynamicObject` by label.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::Client;
use tracing::{debug, info};

use lattice_common::crd::{Repository, RepositoryInfo, StorageKey, REPOSITORY_LABEL};
use lattice_common::kube_utils::is_not_found;
use lattice_common::{Error, STORAGE_API_GROUP};

use crate::remote::MetadataStore;

const SNAPSHOT_VERSION: &str = "v1alpha1";
const SNAPSHOT_KIND: &str = "Snapshot";
const SNAPSHOT_PLURAL: &str = "snapshots";

/// API resource of the Snapshot objects recorded per repository
pub fn snapshot_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(STORAGE_API_GROUP, SNAPSHOT_VERSION, SNAPSHOT_KIND);
    ApiResource::from_gvk_with_plural(&gvk, SNAPSHOT_PLURAL)
}

fn snapshot_selector(repository: &str) -> String {
    format!("{}={}", REPOSITORY_LABEL, repository)
}

fn storage_ref_patch(successor: &StorageKey) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "storageRef": {
                "name": successor.name,
                "namespace": successor.namespace,
            }
        }
    })
}

/// [`MetadataStore`] that edits Repository and Snapshot objects
pub struct KubeMetadataStore {
    client: Client,
}

impl KubeMetadataStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn delete_snapshots(&self, repository: &RepositoryInfo) -> Result<(), Error> {
        let ar = snapshot_api_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &repository.namespace, &ar);
        let params = ListParams::default().labels(&snapshot_selector(&repository.name));

        match api.delete_collection(&DeleteParams::default(), &params).await {
            Ok(_) => Ok(()),
            // Snapshot CRD not installed, or nothing to delete
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_repository(&self, repository: &RepositoryInfo) -> Result<(), Error> {
        let api: Api<Repository> = Api::namespaced(self.client.clone(), &repository.namespace);
        match api.delete(&repository.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(repository = %repository.qualified_name(), "repository already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MetadataStore for KubeMetadataStore {
    async fn remove_dependents(
        &self,
        storage: &StorageKey,
        repositories: &[RepositoryInfo],
    ) -> Result<(), Error> {
        for repository in repositories {
            self.delete_snapshots(repository).await?;
            self.delete_repository(repository).await?;
        }
        info!(
            backup_storage = %storage,
            count = repositories.len(),
            "dependent repositories removed"
        );
        Ok(())
    }

    async fn reassign(
        &self,
        storage: &StorageKey,
        successor: &StorageKey,
        repositories: &[RepositoryInfo],
    ) -> Result<(), Error> {
        let patch = storage_ref_patch(successor);
        for repository in repositories {
            let api: Api<Repository> =
                Api::namespaced(self.client.clone(), &repository.namespace);
            match api
                .patch(&repository.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        info!(
            backup_storage = %storage,
            successor = %successor,
            count = repositories.len(),
            "repositories reassigned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_api_resource() {
        let ar = snapshot_api_resource();
        assert_eq!(ar.group, "storage.lattice.dev");
        assert_eq!(ar.api_version, "storage.lattice.dev/v1alpha1");
        assert_eq!(ar.kind, "Snapshot");
        assert_eq!(ar.plural, "snapshots");
    }

    #[test]
    fn test_snapshot_selector_uses_repository_label() {
        assert_eq!(snapshot_selector("db"), "storage.lattice.dev/repository=db");
    }

    #[test]
    fn test_storage_ref_patch_names_successor() {
        let patch = storage_ref_patch(&StorageKey::new("archive", "gcs"));
        assert_eq!(patch["spec"]["storageRef"]["name"], "gcs");
        assert_eq!(patch["spec"]["storageRef"]["namespace"], "archive");
    }
}
