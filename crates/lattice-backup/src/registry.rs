//! BackupStorage registry
//!
//! The registry is the single owner of every registered BackupStorage and
//! the repositories bound to it. It routes lifecycle events to the policy,
//! aggregation and deletion engines and republishes status after each
//! completed pass.
//!
//! Concurrency model:
//! - one async mutex per storage serializes every pass on that storage
//! - passes on different storages run in parallel (`DashMap` shards)
//! - readers only ever see the last completed pass (`published`)
//! - default conflicts live beside the records and are merged in at publish
//!   time, so a conflict scan never waits on a record lock

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lattice_common::crd::{
    find_condition, remove_condition, set_condition, BackupStorage, BackupStoragePhase,
    BackupStorageStatus, Condition, ConditionStatus, RepositoryInfo, StorageKey,
    CONDITION_DEFAULT_CONFLICT, CONDITION_DELETION_BLOCKED, CONDITION_INVALID_BACKEND,
    CONDITION_WIPE_FAILED,
};
use lattice_common::{Error, Result};

use crate::aggregator::{aggregate, RepositorySnapshot};
use crate::backend::{resolve, BackendLocation};
use crate::deletion::{
    DeleteRequest, DeletionExecutor, DeletionOutcome, DeletionTarget, WipeLedger,
    DEFAULT_WIPE_TIMEOUT,
};
use crate::remote::{MetadataStore, RemoteStorage};
use crate::usage_policy::{
    default_conflicts, is_permitted_with_labels, select_default, NamespaceLabels, PolicyConflict,
};

const REGISTRY_CONTEXT: &str = "registry";

/// Registry tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Bound on each remote wipe call
    pub wipe_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            wipe_timeout: DEFAULT_WIPE_TIMEOUT,
        }
    }
}

/// A change to one repository bound to a storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepositoryEvent {
    /// A repository started using the storage
    Attached(RepositorySnapshot),
    /// A bound repository reported new state
    Updated(RepositorySnapshot),
    /// A repository stopped using the storage
    Detached {
        /// Repository name
        name: String,
        /// Repository namespace
        namespace: String,
    },
}

struct StorageRecord {
    storage: BackupStorage,
    location: BackendLocation,
    snapshots: BTreeMap<(String, String), RepositorySnapshot>,
    /// Status without the default-conflict condition
    status: BackupStorageStatus,
    ledger: WipeLedger,
    removed: bool,
}

impl StorageRecord {
    fn new(storage: BackupStorage, location: BackendLocation) -> Self {
        let mut record = Self {
            storage,
            location,
            snapshots: BTreeMap::new(),
            status: BackupStorageStatus::default(),
            ledger: WipeLedger::default(),
            removed: false,
        };

        // Resume from the last status written before a restart
        if let Some(mut status) = record.storage.status.take() {
            remove_condition(&mut status.conditions, CONDITION_DEFAULT_CONFLICT);
            remove_condition(&mut status.conditions, CONDITION_INVALID_BACKEND);
            for info in &status.repositories {
                let snapshot = RepositorySnapshot::from(info);
                record.snapshots.insert(snapshot.key(), snapshot);
            }
            record.ledger = WipeLedger::resume(&status.wiped_paths);
            record.status = status;
        }
        record
    }

    fn snapshots(&self) -> Vec<RepositorySnapshot> {
        self.snapshots.values().cloned().collect()
    }

    /// Every attached repository, in status order
    fn repositories(&self) -> Vec<RepositoryInfo> {
        aggregate(&self.snapshots(), &[]).repositories
    }

    fn block_deletion(&mut self, reason: &str, message: String) {
        set_condition(
            &mut self.status.conditions,
            Condition::new(CONDITION_DELETION_BLOCKED, ConditionStatus::True, reason, message),
        );
        self.refresh();
    }

    /// Rebuild the status from the current snapshot set
    fn refresh(&mut self) {
        let snapshots: Vec<RepositorySnapshot> = match self.status.phase {
            BackupStoragePhase::WipeFailed => self
                .snapshots
                .values()
                .filter(|s| self.ledger.needs_wipe(&s.path))
                .cloned()
                .collect(),
            _ => self.snapshots(),
        };

        let mut status = aggregate(&snapshots, &self.status.conditions);
        status.phase = self.status.phase;
        status.observed_generation = self.storage.metadata.generation;
        status.wiped_paths = self.ledger.confirmed().map(str::to_string).collect();
        self.status = status;
    }
}

/// Store of registered BackupStorages
pub struct StorageRegistry {
    records: DashMap<StorageKey, Arc<Mutex<StorageRecord>>>,
    published: DashMap<StorageKey, BackupStorage>,
    conflicts: DashMap<StorageKey, BTreeSet<String>>,
    namespaces: DashMap<String, NamespaceLabels>,
    executor: DeletionExecutor,
}

impl StorageRegistry {
    /// Create an empty registry
    pub fn new(
        config: RegistryConfig,
        remote: Arc<dyn RemoteStorage>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            records: DashMap::new(),
            published: DashMap::new(),
            conflicts: DashMap::new(),
            namespaces: DashMap::new(),
            executor: DeletionExecutor::new(remote, metadata, config.wipe_timeout),
        }
    }

    fn record(&self, key: &StorageKey) -> Result<Arc<Mutex<StorageRecord>>> {
        self.records
            .get(key)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| {
                Error::internal_with_context(
                    REGISTRY_CONTEXT,
                    format!("BackupStorage {} is not registered", key),
                )
            })
    }

    fn not_registered(key: &StorageKey) -> Error {
        Error::internal_with_context(
            REGISTRY_CONTEXT,
            format!("BackupStorage {} was removed", key),
        )
    }

    /// Register or update a BackupStorage.
    ///
    /// Rejects invalid backend descriptors without touching any existing
    /// registration. Published status survives spec updates.
    pub async fn upsert(&self, storage: BackupStorage) -> Result<StorageKey> {
        let key = storage
            .storage_key()
            .ok_or_else(|| Error::validation("BackupStorage has no namespace"))?;
        let backend = storage
            .spec
            .storage
            .backend()
            .map_err(|e| Error::invalid_backend(key.to_string(), &e))?;
        let location = resolve(&backend);

        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(StorageRecord::new(
                    storage.clone(),
                    location.clone(),
                )))
            })
            .value()
            .clone();

        {
            let mut record = record.lock().await;
            if record.removed {
                return Err(Self::not_registered(&key));
            }
            record.storage = BackupStorage {
                status: None,
                ..storage
            };
            record.location = location;
            record.refresh();
            self.publish(&key, &record);
        }

        debug!(backup_storage = %key, "BackupStorage registered");
        self.refresh_default_conflicts();
        Ok(key)
    }

    /// Record the labels of a namespace for `Selector` usage policies
    pub fn observe_namespace(&self, name: impl Into<String>, labels: NamespaceLabels) {
        let name = name.into();
        let changed = self
            .namespaces
            .insert(name, labels.clone())
            .is_none_or(|previous| previous != labels);
        if changed {
            self.refresh_default_conflicts();
        }
    }

    /// Forget a deleted namespace
    pub fn forget_namespace(&self, name: &str) {
        if self.namespaces.remove(name).is_some() {
            self.refresh_default_conflicts();
        }
    }

    /// Names of every namespace observed so far, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn namespace_labels(&self, namespace: &str) -> Option<NamespaceLabels> {
        self.namespaces.get(namespace).map(|l| l.value().clone())
    }

    /// Storages that still accept repositories
    fn active_storages(&self) -> Vec<BackupStorage> {
        self.published
            .iter()
            .filter(|entry| {
                let storage = entry.value();
                storage.metadata.deletion_timestamp.is_none()
                    && storage
                        .status
                        .as_ref()
                        .is_none_or(|s| s.phase == BackupStoragePhase::Active)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The default storage for `namespace`, or the conflict preventing one
    pub fn compute_default(
        &self,
        namespace: &str,
    ) -> std::result::Result<Option<StorageKey>, PolicyConflict> {
        let storages = self.active_storages();
        let labels = self.namespace_labels(namespace);
        select_default(&storages, namespace, labels.as_ref())
            .map(|selected| selected.and_then(BackupStorage::storage_key))
    }

    /// Whether `namespace` may use the storage at `key`
    pub fn permits(&self, key: &StorageKey, namespace: &str) -> bool {
        let Some(storage) = self.published.get(key).map(|s| s.value().clone()) else {
            return false;
        };
        let labels = self.namespace_labels(namespace);
        is_permitted_with_labels(
            &key.namespace,
            storage.spec.usage_policy.as_ref(),
            namespace,
            labels.as_ref(),
        )
    }

    fn admission_error(key: &StorageKey, namespace: &str) -> Error {
        Error::validation_for_field(
            key.to_string(),
            "spec.usagePolicy.allowedNamespaces",
            format!("namespace '{}' may not use this BackupStorage", namespace),
        )
    }

    /// Apply one repository lifecycle event and republish
    pub async fn on_repository_event(
        &self,
        key: &StorageKey,
        event: RepositoryEvent,
    ) -> Result<BackupStorageStatus> {
        if let RepositoryEvent::Attached(snapshot) | RepositoryEvent::Updated(snapshot) = &event {
            if !self.permits(key, &snapshot.namespace) {
                return Err(Self::admission_error(key, &snapshot.namespace));
            }
        }

        let record = self.record(key)?;
        let mut record = record.lock().await;
        if record.removed {
            return Err(Self::not_registered(key));
        }

        match event {
            RepositoryEvent::Attached(snapshot) | RepositoryEvent::Updated(snapshot) => {
                debug!(backup_storage = %key, repository = %snapshot.name, "repository observed");
                record.snapshots.insert(snapshot.key(), snapshot);
            }
            RepositoryEvent::Detached { name, namespace } => {
                debug!(backup_storage = %key, repository = %name, "repository detached");
                record.snapshots.remove(&(namespace, name));
            }
        }

        record.refresh();
        Ok(self.publish(key, &record))
    }

    /// Replace the full snapshot set of a storage and republish.
    ///
    /// Snapshots from namespaces the usage policy does not admit are
    /// dropped.
    pub async fn reconcile_repositories(
        &self,
        key: &StorageKey,
        snapshots: Vec<RepositorySnapshot>,
    ) -> Result<BackupStorageStatus> {
        let (admitted, denied): (Vec<_>, Vec<_>) = snapshots
            .into_iter()
            .partition(|s| self.permits(key, &s.namespace));
        for snapshot in &denied {
            warn!(
                backup_storage = %key,
                repository = %snapshot.name,
                namespace = %snapshot.namespace,
                "repository namespace not allowed by usage policy, ignoring"
            );
        }

        let record = self.record(key)?;
        let mut record = record.lock().await;
        if record.removed {
            return Err(Self::not_registered(key));
        }

        record.snapshots = admitted.into_iter().map(|s| (s.key(), s)).collect();
        record.refresh();
        Ok(self.publish(key, &record))
    }

    /// Hold a storage back from teardown, recording why in `DeletionBlocked`
    pub async fn block_deletion(
        &self,
        key: &StorageKey,
        reason: &str,
        message: String,
    ) -> Result<BackupStorageStatus> {
        let record = self.record(key)?;
        let mut record = record.lock().await;
        if record.removed {
            return Err(Self::not_registered(key));
        }
        info!(backup_storage = %key, reason, "deletion blocked");
        record.block_deletion(reason, message);
        Ok(self.publish(key, &record))
    }

    /// Delete with the default request (cascade to repositories)
    pub async fn delete(&self, key: &StorageKey) -> Result<BackupStorageStatus> {
        self.delete_with(key, DeleteRequest::default()).await
    }

    /// Run the deletion policy of a storage.
    ///
    /// The registration is removed only once teardown reports `Deleted`.
    /// Any other outcome is published and the caller retries later.
    pub async fn delete_with(
        &self,
        key: &StorageKey,
        request: DeleteRequest,
    ) -> Result<BackupStorageStatus> {
        let record = self.record(key)?;
        let mut record = record.lock().await;
        if record.removed {
            return Err(Self::not_registered(key));
        }

        if let Some(successor) = &request.successor {
            let repositories = record.repositories();
            if let Some(reason) = self.successor_rejection(key, successor, &repositories) {
                warn!(backup_storage = %key, successor = %successor, reason = %reason, "successor rejected");
                record.block_deletion("InvalidSuccessor", format!("successor {} {}", successor, reason));
                return Ok(self.publish(key, &record));
            }
        }

        if record.status.phase == BackupStoragePhase::Active {
            record.status.phase = BackupStoragePhase::PendingDeletion;
            self.publish(key, &record);
        }
        info!(
            backup_storage = %key,
            policy = %record.storage.spec.deletion_policy,
            phase = %record.status.phase,
            "running deletion policy"
        );

        let repositories = record.repositories();
        let location = record.location.clone();
        let policy = record.storage.spec.deletion_policy;
        let target = DeletionTarget {
            key,
            policy,
            location: &location,
            repositories: &repositories,
        };
        let outcome = self
            .executor
            .execute(target, &request, &mut record.ledger)
            .await;

        match outcome {
            DeletionOutcome::Deleted => {
                record.removed = true;
                record.snapshots.clear();
                record.status.phase = BackupStoragePhase::Deleted;
                remove_condition(&mut record.status.conditions, CONDITION_DELETION_BLOCKED);
                remove_condition(&mut record.status.conditions, CONDITION_WIPE_FAILED);
                record.refresh();
                let status = record.status.clone();

                self.records.remove(key);
                self.published.remove(key);
                self.conflicts.remove(key);
                drop(record);

                info!(backup_storage = %key, "BackupStorage deleted");
                self.refresh_default_conflicts();
                Ok(status)
            }
            DeletionOutcome::Blocked { attached } => {
                record.status.phase = BackupStoragePhase::Active;
                set_condition(
                    &mut record.status.conditions,
                    Condition::new(
                        CONDITION_DELETION_BLOCKED,
                        ConditionStatus::True,
                        "RepositoriesAttached",
                        format!(
                            "{} repositories still use this storage: {}",
                            attached.len(),
                            attached.join(", ")
                        ),
                    ),
                );
                record.refresh();
                Ok(self.publish(key, &record))
            }
            DeletionOutcome::WipeFailed { remaining, failures } => {
                record.status.phase = BackupStoragePhase::WipeFailed;
                let details: Vec<String> = failures
                    .iter()
                    .map(|(path, err)| format!("{}: {}", location.join(path), err))
                    .collect();
                set_condition(
                    &mut record.status.conditions,
                    Condition::new(
                        CONDITION_WIPE_FAILED,
                        ConditionStatus::True,
                        "RemoteError",
                        format!(
                            "{} repositories not wiped; {}",
                            remaining.len(),
                            details.join("; ")
                        ),
                    ),
                );
                remove_condition(&mut record.status.conditions, CONDITION_DELETION_BLOCKED);
                record.refresh();
                Ok(self.publish(key, &record))
            }
            DeletionOutcome::MetadataFailed(e) => {
                set_condition(
                    &mut record.status.conditions,
                    Condition::new(
                        CONDITION_DELETION_BLOCKED,
                        ConditionStatus::True,
                        "MetadataUpdateFailed",
                        e.to_string(),
                    ),
                );
                record.refresh();
                Ok(self.publish(key, &record))
            }
        }
    }

    /// Why `successor` cannot take over `repositories` from `key`, if it can't
    fn successor_rejection(
        &self,
        key: &StorageKey,
        successor: &StorageKey,
        repositories: &[RepositoryInfo],
    ) -> Option<String> {
        if repositories.is_empty() {
            return None;
        }
        if successor == key {
            return Some("is the storage being deleted".to_string());
        }
        let accepting = self
            .active_storages()
            .iter()
            .any(|s| s.storage_key().as_ref() == Some(successor));
        if !accepting {
            return Some("is not registered or is being deleted".to_string());
        }
        let denied: BTreeSet<&str> = repositories
            .iter()
            .filter(|r| !self.permits(successor, &r.namespace))
            .map(|r| r.namespace.as_str())
            .collect();
        if !denied.is_empty() {
            return Some(format!(
                "does not admit namespaces: {}",
                denied.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        None
    }

    /// Published status of a storage
    pub fn status(&self, key: &StorageKey) -> Option<BackupStorageStatus> {
        self.published
            .get(key)
            .and_then(|storage| storage.value().status.clone())
    }

    /// Published object of a storage, with its latest status
    pub fn get(&self, key: &StorageKey) -> Option<BackupStorage> {
        self.published.get(key).map(|storage| storage.value().clone())
    }

    /// Every published storage, ordered by key
    pub fn list(&self) -> Vec<BackupStorage> {
        let mut storages: Vec<(StorageKey, BackupStorage)> = self
            .published
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        storages.sort_by(|a, b| a.0.cmp(&b.0));
        storages.into_iter().map(|(_, storage)| storage).collect()
    }

    /// Number of registered storages
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no storage is registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drain every record, waiting for in-flight passes to finish
    pub async fn shutdown(&self) {
        let keys: Vec<StorageKey> = self.records.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((_, record)) = self.records.remove(&key) else {
                continue;
            };
            record.lock().await.removed = true;
        }
        self.published.clear();
        self.conflicts.clear();
        self.namespaces.clear();
        info!("storage registry drained");
    }

    /// Swap in the status of a completed pass
    fn publish(&self, key: &StorageKey, record: &StorageRecord) -> BackupStorageStatus {
        let mut status = record.status.clone();
        let previous = self.status(key);
        let previous_conflict = previous
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, CONDITION_DEFAULT_CONFLICT));
        let namespaces = self.conflicts.get(key).map(|n| n.value().clone());
        apply_conflict(&mut status.conditions, previous_conflict, namespaces.as_ref());

        let mut storage = record.storage.clone();
        storage.status = Some(status.clone());
        self.published.insert(key.clone(), storage);
        status
    }

    /// Rescan default conflicts and update published conditions
    fn refresh_default_conflicts(&self) {
        let storages = self.active_storages();
        let namespaces: Vec<(String, NamespaceLabels)> = self
            .namespaces
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let conflicts = default_conflicts(
            &storages,
            namespaces.iter().map(|(ns, labels)| (ns.as_str(), Some(labels))),
        );

        self.conflicts.retain(|key, _| conflicts.contains_key(key));
        for (key, namespaces) in &conflicts {
            let previous = self.conflicts.insert(key.clone(), namespaces.clone());
            if previous.as_ref() != Some(namespaces) {
                warn!(
                    backup_storage = %key,
                    namespaces = ?namespaces,
                    "multiple default BackupStorages apply"
                );
            }
        }

        for mut entry in self.published.iter_mut() {
            let namespaces = conflicts.get(entry.key()).cloned();
            if let Some(status) = entry.value_mut().status.as_mut() {
                let previous = find_condition(&status.conditions, CONDITION_DEFAULT_CONFLICT).cloned();
                apply_conflict(&mut status.conditions, previous.as_ref(), namespaces.as_ref());
            }
        }
    }
}

/// Set or clear the default-conflict condition
fn apply_conflict(
    conditions: &mut Vec<Condition>,
    previous: Option<&Condition>,
    namespaces: Option<&BTreeSet<String>>,
) {
    match namespaces {
        Some(namespaces) => {
            let mut condition = Condition::new(
                CONDITION_DEFAULT_CONFLICT,
                ConditionStatus::True,
                "MultipleDefaultsConflict",
                format!(
                    "another default BackupStorage applies to: {}",
                    namespaces.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            );
            if let Some(previous) = previous.filter(|p| p.is_true()) {
                condition.last_transition_time = previous.last_transition_time;
            }
            remove_condition(conditions, CONDITION_DEFAULT_CONFLICT);
            set_condition(conditions, condition);
        }
        None => {
            remove_condition(conditions, CONDITION_DEFAULT_CONFLICT);
        }
    }
}
