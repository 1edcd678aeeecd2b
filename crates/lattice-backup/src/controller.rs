//! BackupStorage controller
//!
//! Level-triggered driver for the [`StorageRegistry`]. Each pass registers
//! the BackupStorage, re-reads the Repository objects bound to it and
//! patches the published status back onto the object. Deletion is guarded
//! by the `storage.lattice.dev/deletion` finalizer, which is released only
//! once the deletion policy reports `Deleted`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use lattice_common::crd::{
    set_condition, BackupStorage, BackupStoragePhase, BackupStorageStatus, Condition,
    ConditionStatus, FromNamespaces, Repository, StorageKey, CONDITION_INVALID_BACKEND,
};
use lattice_common::kube_utils::{
    has_finalizer, patch_finalizers, patch_resource_status, with_finalizer, without_finalizer,
};
use lattice_common::{
    REQUEUE_DELETION_SECS, REQUEUE_ERROR_SECS, REQUEUE_SUCCESS_SECS,
    RETAIN_REPOSITORIES_ANNOTATION, STORAGE_FINALIZER, SUCCESSOR_ANNOTATION,
};

use crate::aggregator::RepositorySnapshot;
use crate::deletion::DeleteRequest;
use crate::error::ReconcileError;
use crate::registry::StorageRegistry;
use crate::usage_policy::NamespaceLabels;

const FIELD_MANAGER: &str = "lattice-storage-controller";

/// Kubernetes operations needed by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageKubeClient: Send + Sync {
    /// List every Repository the controller can see
    async fn list_repositories(&self) -> Result<Vec<Repository>, ReconcileError>;

    /// List namespaces with their labels
    async fn list_namespaces(&self) -> Result<Vec<(String, NamespaceLabels)>, ReconcileError>;

    /// Replace the status of a BackupStorage
    async fn patch_status(
        &self,
        key: &StorageKey,
        status: &BackupStorageStatus,
    ) -> Result<(), ReconcileError>;

    /// Replace the finalizer list of a BackupStorage
    async fn set_finalizers(
        &self,
        key: &StorageKey,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError>;
}

/// [`StorageKubeClient`] backed by the API server
pub struct KubeStorageClient {
    client: Client,
    watch_namespace: Option<String>,
}

impl KubeStorageClient {
    /// Create a client, optionally limited to one namespace
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
        }
    }
}

#[async_trait]
impl StorageKubeClient for KubeStorageClient {
    async fn list_repositories(&self) -> Result<Vec<Repository>, ReconcileError> {
        let api: Api<Repository> = match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<(String, NamespaceLabels)>, ReconcileError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await?;
        Ok(namespaces
            .items
            .into_iter()
            .map(|ns| {
                let labels = ns.labels().clone();
                (ns.name_any(), labels)
            })
            .collect())
    }

    async fn patch_status(
        &self,
        key: &StorageKey,
        status: &BackupStorageStatus,
    ) -> Result<(), ReconcileError> {
        patch_resource_status::<BackupStorage>(
            &self.client,
            &key.name,
            &key.namespace,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        key: &StorageKey,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError> {
        patch_finalizers::<BackupStorage>(&self.client, &key.name, &key.namespace, finalizers)
            .await?;
        Ok(())
    }
}

/// Controller tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Requeue interval after a successful pass
    pub requeue: Duration,
    /// Only watch this namespace when set
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue: Duration::from_secs(REQUEUE_SUCCESS_SECS),
            watch_namespace: None,
        }
    }
}

/// Shared state handed to every reconcile
pub struct Context {
    /// Kubernetes client
    pub kube: Arc<dyn StorageKubeClient>,
    /// Registry fed by this controller
    pub registry: Arc<StorageRegistry>,
    /// Controller tuning
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context
    pub fn new(
        kube: Arc<dyn StorageKubeClient>,
        registry: Arc<StorageRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            registry,
            config,
        }
    }
}

/// Reconcile a BackupStorage
#[instrument(skip(storage, ctx), fields(backup_storage = %storage.name_any()))]
pub async fn reconcile(
    storage: Arc<BackupStorage>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let key = storage
        .storage_key()
        .ok_or(ReconcileError::MissingNamespace {
            kind: "BackupStorage",
        })?;

    if storage.metadata.deletion_timestamp.is_some() {
        return reconcile_deletion(&storage, &key, &ctx).await;
    }

    debug!(backup_storage = %key, "reconciling BackupStorage");

    if !has_finalizer(storage.as_ref(), STORAGE_FINALIZER) {
        ctx.kube
            .set_finalizers(&key, with_finalizer(storage.finalizers(), STORAGE_FINALIZER))
            .await?;
    }

    match ctx.registry.upsert(storage.as_ref().clone()).await {
        Ok(_) => {}
        Err(e @ lattice_common::Error::Validation { .. }) => {
            warn!(backup_storage = %key, error = %e, "rejecting BackupStorage");
            let status = invalid_backend_status(&storage, &e);
            patch_if_changed(&ctx, &key, storage.status.as_ref(), &status).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    }

    if watches_other_namespaces(&storage) {
        observe_namespaces(&ctx).await?;
    }

    let repositories = ctx.kube.list_repositories().await?;
    let status = ctx
        .registry
        .reconcile_repositories(&key, repository_snapshots(&key, &repositories))
        .await?;
    patch_if_changed(&ctx, &key, storage.status.as_ref(), &status).await?;

    Ok(Action::requeue(ctx.config.requeue))
}

async fn reconcile_deletion(
    storage: &BackupStorage,
    key: &StorageKey,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !has_finalizer(storage, STORAGE_FINALIZER) {
        return Ok(Action::await_change());
    }

    // After a restart the registry is empty; re-register from the object
    if let Err(e) = ctx.registry.upsert(storage.clone()).await {
        match e {
            lattice_common::Error::Validation { .. } if ctx.registry.get(key).is_none() => {
                info!(backup_storage = %key, error = %e, "BackupStorage was never valid, releasing finalizer");
                release_finalizer(storage, key, ctx).await?;
                return Ok(Action::await_change());
            }
            lattice_common::Error::Validation { .. } => {
                warn!(backup_storage = %key, error = %e, "deleting with the last valid backend");
            }
            e => return Err(e.into()),
        }
    }

    if watches_other_namespaces(storage) {
        observe_namespaces(ctx).await?;
    }

    let repositories = ctx.kube.list_repositories().await?;
    let snapshots = repository_snapshots(key, &repositories);
    let unadmitted: Vec<String> = snapshots
        .iter()
        .filter(|s| !ctx.registry.permits(key, &s.namespace))
        .map(|s| format!("{}/{}", s.namespace, s.name))
        .collect();
    ctx.registry.reconcile_repositories(key, snapshots).await?;

    // Teardown waits until unadmitted references are removed or repointed
    if !unadmitted.is_empty() {
        warn!(backup_storage = %key, repositories = ?unadmitted, "unadmitted repositories reference a deleting storage");
        let status = ctx
            .registry
            .block_deletion(
                key,
                "UnadmittedRepositories",
                format!(
                    "{} repositories from namespaces outside the usage policy still reference this storage: {}",
                    unadmitted.len(),
                    unadmitted.join(", ")
                ),
            )
            .await?;
        patch_if_changed(ctx, key, storage.status.as_ref(), &status).await?;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_DELETION_SECS)));
    }

    let request = delete_request(storage, key);
    let status = ctx.registry.delete_with(key, request).await?;

    if status.phase == BackupStoragePhase::Deleted {
        release_finalizer(storage, key, ctx).await?;
        return Ok(Action::await_change());
    }

    patch_if_changed(ctx, key, storage.status.as_ref(), &status).await?;
    Ok(Action::requeue(Duration::from_secs(REQUEUE_DELETION_SECS)))
}

async fn release_finalizer(
    storage: &BackupStorage,
    key: &StorageKey,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    ctx.kube
        .set_finalizers(key, without_finalizer(storage.finalizers(), STORAGE_FINALIZER))
        .await?;
    info!(backup_storage = %key, "finalizer removed");
    Ok(())
}

async fn patch_if_changed(
    ctx: &Context,
    key: &StorageKey,
    current: Option<&BackupStorageStatus>,
    next: &BackupStorageStatus,
) -> Result<(), ReconcileError> {
    if current == Some(next) {
        debug!(backup_storage = %key, "status unchanged, skipping update");
        return Ok(());
    }
    ctx.kube.patch_status(key, next).await
}

/// Whether the usage policy depends on namespaces beyond the declaring one
fn watches_other_namespaces(storage: &BackupStorage) -> bool {
    storage.spec.usage_policy.as_ref().is_some_and(|policy| {
        matches!(
            policy.allowed_namespaces.from,
            FromNamespaces::All | FromNamespaces::Selector
        )
    })
}

async fn observe_namespaces(ctx: &Context) -> Result<(), ReconcileError> {
    let namespaces = ctx.kube.list_namespaces().await?;
    let live: BTreeSet<&str> = namespaces.iter().map(|(name, _)| name.as_str()).collect();

    for name in ctx.registry.namespaces() {
        if !live.contains(name.as_str()) {
            ctx.registry.forget_namespace(&name);
        }
    }
    for (name, labels) in namespaces {
        ctx.registry.observe_namespace(name, labels);
    }
    Ok(())
}

/// Snapshots of the Repository objects that reference `key`
pub fn repository_snapshots(key: &StorageKey, repositories: &[Repository]) -> Vec<RepositorySnapshot> {
    repositories
        .iter()
        .filter_map(|repo| {
            let namespace = repo.namespace()?;
            if repo.spec.storage_ref.key(&namespace) != *key {
                return None;
            }
            let status = repo.status.clone().unwrap_or_default();
            Some(RepositorySnapshot {
                name: repo.name_any(),
                namespace,
                path: repo.spec.path.clone(),
                size: status.size.unwrap_or_default(),
                synced: status.synced,
                error: status.error,
            })
        })
        .collect()
}

/// Deletion request carried by the object's annotations.
///
/// `storage.lattice.dev/successor` names the storage that takes over the
/// repositories (`name` or `namespace/name`); `retain-repositories: "true"`
/// disables the cascade.
pub fn delete_request(storage: &BackupStorage, key: &StorageKey) -> DeleteRequest {
    let annotations = storage.annotations();

    if let Some(successor) = annotations.get(SUCCESSOR_ANNOTATION) {
        let successor = successor.trim();
        let parsed = if successor.contains('/') {
            successor.parse::<StorageKey>()
        } else if successor.is_empty() {
            Err("empty successor".to_string())
        } else {
            Ok(StorageKey::new(&key.namespace, successor))
        };
        match parsed {
            Ok(successor) if successor != *key => return DeleteRequest::reassign_to(successor),
            Ok(_) => {
                warn!(backup_storage = %key, "successor names the storage itself, ignoring")
            }
            Err(e) => warn!(backup_storage = %key, error = %e, "invalid successor annotation"),
        }
    }

    let retain = annotations
        .get(RETAIN_REPOSITORIES_ANNOTATION)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
    if retain {
        DeleteRequest::retain()
    } else {
        DeleteRequest::default()
    }
}

fn invalid_backend_status(storage: &BackupStorage, err: &lattice_common::Error) -> BackupStorageStatus {
    let mut status = storage.status.clone().unwrap_or_default();
    status.ready = false;
    status.observed_generation = storage.metadata.generation;
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_INVALID_BACKEND,
            ConditionStatus::True,
            "ValidationFailed",
            err.to_string(),
        ),
    );
    status
}

/// Error policy for the BackupStorage controller
pub fn error_policy(
    storage: Arc<BackupStorage>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        backup_storage = %storage.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ObjectMeta;
    use lattice_common::crd::{
        find_condition, Backend, BackendSpec, BackupStorageSpec, DeletionPolicy, GcsSpec,
        RepositorySpec, RepositoryStatus, S3Spec, StorageRef, UsagePolicy,
        CONDITION_DELETION_BLOCKED,
    };

    use crate::registry::RegistryConfig;
    use crate::remote::{MockMetadataStore, MockRemoteStorage};

    fn sample_storage(finalized: bool) -> BackupStorage {
        BackupStorage {
            metadata: ObjectMeta {
                name: Some("s3-prod".to_string()),
                namespace: Some("backups".to_string()),
                generation: Some(2),
                finalizers: finalized.then(|| vec![STORAGE_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: BackupStorageSpec {
                storage: BackendSpec::from(Backend::S3(S3Spec {
                    bucket: "lattice-backups".to_string(),
                    ..Default::default()
                })),
                usage_policy: Some(UsagePolicy::namespaces(["demo"])),
                default: false,
                deletion_policy: DeletionPolicy::Delete,
            },
            status: None,
        }
    }

    fn deleting(mut storage: BackupStorage) -> BackupStorage {
        storage.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        storage
    }

    fn repository(name: &str, namespace: &str, storage: &str, size: &str) -> Repository {
        let mut repo = Repository::new(
            name,
            RepositorySpec {
                storage_ref: StorageRef {
                    name: storage.to_string(),
                    namespace: Some("backups".to_string()),
                },
                path: format!("/{}/{}", namespace, name),
            },
        );
        repo.metadata.namespace = Some(namespace.to_string());
        repo.status = Some(RepositoryStatus {
            size: Some(size.to_string()),
            synced: true,
            error: None,
        });
        repo
    }

    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<BackupStorageStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: BackupStorageStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn last(&self) -> Option<BackupStorageStatus> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }
    }

    fn context(kube: MockStorageKubeClient, metadata: MockMetadataStore) -> Arc<Context> {
        let registry = StorageRegistry::new(
            RegistryConfig::default(),
            Arc::new(MockRemoteStorage::new()),
            Arc::new(metadata),
        );
        Arc::new(Context::new(
            Arc::new(kube),
            Arc::new(registry),
            ControllerConfig::default(),
        ))
    }

    /// Story: a new BackupStorage gets its finalizer and a published status
    ///
    /// Only the repositories that reference this storage are counted.
    #[tokio::test]
    async fn story_first_reconcile_publishes_status() {
        let capture = StatusCapture::default();
        let recorded = capture.clone();

        let mut kube = MockStorageKubeClient::new();
        kube.expect_set_finalizers()
            .withf(|key, finalizers| {
                key.name == "s3-prod" && finalizers == &vec![STORAGE_FINALIZER.to_string()]
            })
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_list_repositories().returning(|| {
            Ok(vec![
                repository("db", "demo", "s3-prod", "2 GiB"),
                repository("logs", "demo", "s3-prod", "512 MiB"),
                repository("other", "demo", "gcs-archive", "1 TiB"),
            ])
        });
        kube.expect_patch_status()
            .times(1)
            .returning(move |_, status| {
                recorded.record(status.clone());
                Ok(())
            });

        let ctx = context(kube, MockMetadataStore::new());
        let action = reconcile(Arc::new(sample_storage(false)), ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        let status = capture.last().unwrap();
        assert_eq!(status.total_size, "2.5 GiB");
        assert_eq!(status.repositories.len(), 2);
        assert_eq!(status.phase, BackupStoragePhase::Active);
        assert_eq!(status.observed_generation, Some(2));
        assert!(status.ready);
        assert_eq!(ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_patched() {
        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories()
            .returning(|| Ok(vec![repository("db", "demo", "s3-prod", "1 GiB")]));
        kube.expect_patch_status().times(1).returning(|_, _| Ok(()));

        let ctx = context(kube, MockMetadataStore::new());
        reconcile(Arc::new(sample_storage(true)), ctx.clone())
            .await
            .unwrap();

        // Second pass sees the status written by the first
        let key = StorageKey::new("backups", "s3-prod");
        let mut observed = sample_storage(true);
        observed.status = ctx.registry.status(&key);
        reconcile(Arc::new(observed), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_backend_sets_condition_and_waits() {
        let capture = StatusCapture::default();
        let recorded = capture.clone();

        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories().never();
        kube.expect_patch_status().times(1).returning(move |_, status| {
            recorded.record(status.clone());
            Ok(())
        });

        let mut storage = sample_storage(true);
        storage.spec.storage.gcs = Some(GcsSpec {
            bucket: "second".to_string(),
            ..Default::default()
        });

        let ctx = context(kube, MockMetadataStore::new());
        let action = reconcile(Arc::new(storage), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last().unwrap();
        assert!(!status.ready);
        let condition = find_condition(&status.conditions, CONDITION_INVALID_BACKEND).unwrap();
        assert_eq!(condition.reason, "ValidationFailed");
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_selector_policy_observes_namespaces() {
        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_namespaces().times(1).returning(|| {
            Ok(vec![
                ("demo".to_string(), BTreeMap::from([("team".to_string(), "data".to_string())])),
                ("tools".to_string(), BTreeMap::new()),
            ])
        });
        kube.expect_list_repositories().returning(|| Ok(vec![]));
        kube.expect_patch_status().returning(|_, _| Ok(()));

        let mut storage = sample_storage(true);
        storage.spec.usage_policy = Some(UsagePolicy::all_namespaces());

        let ctx = context(kube, MockMetadataStore::new());
        reconcile(Arc::new(storage), ctx.clone()).await.unwrap();

        assert_eq!(ctx.registry.namespaces(), vec!["demo", "tools"]);
    }

    /// Story: deleting a storage with the default policy
    ///
    /// Dependent repositories are removed, nothing is wiped and the
    /// finalizer is released.
    #[tokio::test]
    async fn story_delete_removes_dependents_and_finalizer() {
        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories().returning(|| {
            Ok(vec![
                repository("db", "demo", "s3-prod", "1 GiB"),
                repository("logs", "demo", "s3-prod", "1 GiB"),
            ])
        });
        kube.expect_set_finalizers()
            .withf(|_, finalizers| finalizers.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_patch_status().never();

        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_remove_dependents()
            .withf(|key, repos| key.name == "s3-prod" && repos.len() == 2)
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(kube, metadata);
        let action = reconcile(Arc::new(deleting(sample_storage(true))), ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_retained_repositories_block_deletion() {
        let capture = StatusCapture::default();
        let recorded = capture.clone();

        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories()
            .returning(|| Ok(vec![repository("db", "demo", "s3-prod", "1 GiB")]));
        kube.expect_set_finalizers().never();
        kube.expect_patch_status().returning(move |_, status| {
            recorded.record(status.clone());
            Ok(())
        });

        let mut storage = deleting(sample_storage(true));
        storage.metadata.annotations = Some(BTreeMap::from([(
            RETAIN_REPOSITORIES_ANNOTATION.to_string(),
            "true".to_string(),
        )]));

        let ctx = context(kube, MockMetadataStore::new());
        let action = reconcile(Arc::new(storage), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        let status = capture.last().unwrap();
        let blocked = find_condition(&status.conditions, CONDITION_DELETION_BLOCKED).unwrap();
        assert!(blocked.message.contains("demo/db"));
    }

    /// Story: a repository outside the usage policy still points at a
    /// deleting storage
    ///
    /// Teardown waits with the finalizer in place until that repository is
    /// removed or repointed.
    #[tokio::test]
    async fn story_unadmitted_repository_blocks_deletion() {
        let capture = StatusCapture::default();
        let recorded = capture.clone();

        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories().returning(|| {
            Ok(vec![
                repository("db", "demo", "s3-prod", "1 GiB"),
                repository("scratch", "tools", "s3-prod", "1 GiB"),
            ])
        });
        kube.expect_set_finalizers().never();
        kube.expect_patch_status().returning(move |_, status| {
            recorded.record(status.clone());
            Ok(())
        });
        let mut metadata = MockMetadataStore::new();
        metadata.expect_remove_dependents().never();

        let ctx = context(kube, metadata);
        let action = reconcile(Arc::new(deleting(sample_storage(true))), ctx.clone())
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        let status = capture.last().unwrap();
        let blocked = find_condition(&status.conditions, CONDITION_DELETION_BLOCKED).unwrap();
        assert_eq!(blocked.reason, "UnadmittedRepositories");
        assert!(blocked.message.contains("tools/scratch"));
        assert_eq!(status.repositories.len(), 1);
        assert_eq!(ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_deletion_without_finalizer_is_noop() {
        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories().never();
        kube.expect_set_finalizers().never();

        let ctx = context(kube, MockMetadataStore::new());
        let action = reconcile(Arc::new(deleting(sample_storage(false))), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_never_valid_storage_releases_finalizer() {
        let mut kube = MockStorageKubeClient::new();
        kube.expect_list_repositories().never();
        kube.expect_set_finalizers().times(1).returning(|_, _| Ok(()));

        let mut storage = deleting(sample_storage(true));
        storage.spec.storage.s3 = None;

        let ctx = context(kube, MockMetadataStore::new());
        let action = reconcile(Arc::new(storage), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn test_repository_snapshots_filter_by_storage() {
        let key = StorageKey::new("backups", "s3-prod");
        let mut local = repository("cache", "backups", "s3-prod", "");
        local.spec.storage_ref.namespace = None;
        local.status = None;

        let snapshots = repository_snapshots(
            &key,
            &[
                repository("db", "demo", "s3-prod", "1 GiB"),
                repository("other", "demo", "gcs-archive", "1 GiB"),
                local,
            ],
        );

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].path, "/demo/db");
        assert_eq!(snapshots[1].name, "cache");
        assert!(snapshots[1].size.is_empty());
        assert!(!snapshots[1].synced);
    }

    #[test]
    fn test_delete_request_from_annotations() {
        let key = StorageKey::new("backups", "s3-prod");
        let annotated = |pairs: &[(&str, &str)]| {
            let mut storage = sample_storage(true);
            storage.metadata.annotations = Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            storage
        };

        assert_eq!(delete_request(&sample_storage(true), &key), DeleteRequest::default());
        assert_eq!(
            delete_request(&annotated(&[(SUCCESSOR_ANNOTATION, "s3-next")]), &key),
            DeleteRequest::reassign_to(StorageKey::new("backups", "s3-next"))
        );
        assert_eq!(
            delete_request(&annotated(&[(SUCCESSOR_ANNOTATION, "archive/gcs")]), &key),
            DeleteRequest::reassign_to(StorageKey::new("archive", "gcs"))
        );
        assert_eq!(
            delete_request(&annotated(&[(RETAIN_REPOSITORIES_ANNOTATION, "True")]), &key),
            DeleteRequest::retain()
        );
        // Self-reference and garbage fall back to the other annotations
        assert_eq!(
            delete_request(
                &annotated(&[
                    (SUCCESSOR_ANNOTATION, "backups/s3-prod"),
                    (RETAIN_REPOSITORIES_ANNOTATION, "true")
                ]),
                &key
            ),
            DeleteRequest::retain()
        );
        assert_eq!(
            delete_request(&annotated(&[(SUCCESSOR_ANNOTATION, "a/b/c")]), &key),
            DeleteRequest::default()
        );
    }

    #[test]
    fn test_error_policy_requeue() {
        let ctx = context(MockStorageKubeClient::new(), MockMetadataStore::new());
        let storage = Arc::new(sample_storage(true));

        let transient: ReconcileError = lattice_common::Error::internal("flaky").into();
        assert_eq!(
            error_policy(storage.clone(), &transient, ctx.clone()),
            Action::requeue(Duration::from_secs(30))
        );

        let permanent = ReconcileError::MissingNamespace {
            kind: "BackupStorage",
        };
        assert_eq!(error_policy(storage, &permanent, ctx), Action::await_change());
    }
}
