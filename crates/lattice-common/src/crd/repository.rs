//! Repository Custom Resource Definition
//!
//! A Repository is one application's backed-up data set inside a
//! BackupStorage. Only the fields the storage controller needs are modelled
//! here: which storage the repository lives in, where, and the sync state
//! reported by the backup tooling.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup_storage::StorageKey;

/// Label carried by Snapshot objects naming their Repository
pub const REPOSITORY_LABEL: &str = "storage.lattice.dev/repository";

/// Reference to a BackupStorage, optionally in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageRef {
    /// Name of the BackupStorage
    pub name: String,

    /// Namespace of the BackupStorage (defaults to the Repository namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl StorageRef {
    /// Resolve to a key, defaulting the namespace to the referencing object's
    pub fn key(&self, default_namespace: &str) -> StorageKey {
        StorageKey::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            &self.name,
        )
    }
}

/// Observed state of a Repository, written by the backup tooling
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    /// Size of the backed-up data (e.g., "512 MiB")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Whether the repository state matches the backend
    #[serde(default)]
    pub synced: bool,

    /// Reason for the last sync failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Specification for a Repository
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "storage.lattice.dev",
    version = "v1alpha1",
    kind = "Repository",
    plural = "repositories",
    shortname = "repo",
    namespaced,
    status = "RepositoryStatus",
    printcolumn = r#"{"name":"Storage","type":"string","jsonPath":".spec.storageRef.name"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".status.size"}"#,
    printcolumn = r#"{"name":"Synced","type":"boolean","jsonPath":".status.synced"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// BackupStorage holding this repository
    pub storage_ref: StorageRef,

    /// Directory of the repository relative to the storage root
    pub path: String,
}
