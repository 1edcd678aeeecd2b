//! Custom Resource Definitions for Lattice backup storage
//!
//! This module contains the CRDs watched by the storage controller.

mod backup_storage;
mod repository;
mod types;
mod usage_policy;

pub use backup_storage::{
    AzureSpec, B2Spec, Backend, BackendSpec, BackendValidationError, BackupStorage,
    BackupStoragePhase, BackupStorageSpec, BackupStorageStatus, ClaimVolume, DeletionPolicy,
    GcsSpec, HostPathVolume, LocalSpec, LocalVolumeSource, NfsVolume, RepositoryInfo,
    RestServerSpec, S3Spec, StorageKey, StorageProvider, SwiftSpec,
    CONDITION_DEFAULT_CONFLICT, CONDITION_DELETION_BLOCKED, CONDITION_INVALID_BACKEND,
    CONDITION_REPOSITORY_SIZE_INVALID, CONDITION_REPOSITORY_SYNC_FAILED, CONDITION_WIPE_FAILED,
};
pub use repository::{Repository, RepositorySpec, RepositoryStatus, StorageRef, REPOSITORY_LABEL};
pub use types::{find_condition, remove_condition, set_condition, Condition, ConditionStatus};
pub use usage_policy::{
    AllowedNamespaces, FromNamespaces, LabelSelectorOperator, LabelSelectorRequirement,
    NamespaceSelector, UsagePolicy,
};
