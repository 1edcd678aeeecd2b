//! BackupStorage Custom Resource Definition
//!
//! A BackupStorage describes where backed-up data lives: a bucket, a blob
//! container, an in-cluster volume or a REST server. Repositories reference
//! a BackupStorage instead of carrying their own backend configuration.
//!
//! The wire form (`BackendSpec`) keeps one optional payload per provider so
//! that manifests stay readable (`provider: s3` + `s3: {...}`). Nothing
//! outside this module should inspect those optionals directly: call
//! [`BackendSpec::backend`] to get the validated [`Backend`] tagged union.

use std::fmt;
use std::str::FromStr;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::usage_policy::UsagePolicy;

/// Condition type set while one or more repositories report a sync error
pub const CONDITION_REPOSITORY_SYNC_FAILED: &str = "RepositorySyncFailed";
/// Condition type set while one or more repository sizes cannot be parsed
pub const CONDITION_REPOSITORY_SIZE_INVALID: &str = "RepositorySizeInvalid";
/// Condition type set while several default storages apply to one namespace
pub const CONDITION_DEFAULT_CONFLICT: &str = "DefaultConflict";
/// Condition type set while deletion waits for attached repositories
pub const CONDITION_DELETION_BLOCKED: &str = "DeletionBlocked";
/// Condition type set while a WipeOut deletion has unwiped paths left
pub const CONDITION_WIPE_FAILED: &str = "WipeFailed";
/// Condition type set when the backend descriptor is rejected
pub const CONDITION_INVALID_BACKEND: &str = "InvalidBackend";

/// Storage provider tag
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// In-cluster volume mounted into the backup job
    Local,
    /// Amazon S3 and S3-compatible stores
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Azure Blob Storage
    Azure,
    /// OpenStack Swift
    Swift,
    /// Backblaze B2
    B2,
    /// Restic REST server
    Rest,
}

impl StorageProvider {
    /// All provider tags, in declaration order
    pub const ALL: [StorageProvider; 7] = [
        Self::Local,
        Self::S3,
        Self::Gcs,
        Self::Azure,
        Self::Swift,
        Self::B2,
        Self::Rest,
    ];

    /// Wire name of the provider
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Azure => "azure",
            Self::Swift => "swift",
            Self::B2 => "b2",
            Self::Rest => "rest",
        }
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown storage provider: {}", s))
    }
}

/// Host path volume for the local provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostPathVolume {
    /// Path on the node
    pub path: String,
}

/// PersistentVolumeClaim volume for the local provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolume {
    /// Name of the PersistentVolumeClaim in the backup namespace
    pub claim_name: String,

    /// Mount the claim read-only
    #[serde(default)]
    pub read_only: bool,
}

/// NFS volume for the local provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NfsVolume {
    /// NFS server hostname or address
    pub server: String,

    /// Exported path
    pub path: String,

    /// Mount the export read-only
    #[serde(default)]
    pub read_only: bool,
}

/// Volume backing the local provider. Exactly one member must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSource {
    /// Directory on the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolume>,

    /// PersistentVolumeClaim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimVolume>,

    /// NFS export
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsVolume>,
}

impl LocalVolumeSource {
    fn populated(&self) -> usize {
        usize::from(self.host_path.is_some())
            + usize::from(self.persistent_volume_claim.is_some())
            + usize::from(self.nfs.is_some())
    }
}

/// Local (volume) backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    /// Volume to mount. The volume must exist before it is used as a backend.
    #[serde(flatten)]
    pub volume_source: LocalVolumeSource,

    /// Directory where the volume is mounted
    pub mount_path: String,

    /// Path within the volume to use as the backend root. Defaults to the volume root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// S3 or S3-compatible backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    /// Endpoint URL for S3-compatible stores (e.g., MinIO)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bucket name
    pub bucket: String,

    /// Directory inside the bucket used by this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Bucket region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Secret holding the access credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Google Cloud Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSpec {
    /// Bucket name
    pub bucket: String,

    /// Directory inside the bucket used by this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Maximum concurrent connections for upload/download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Secret holding the access credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Azure Blob Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureSpec {
    /// Blob container name
    pub container: String,

    /// Directory inside the container used by this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Maximum concurrent connections for upload/download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Secret holding the access credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// OpenStack Swift backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwiftSpec {
    /// Swift container name
    pub container: String,

    /// Directory inside the container used by this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Secret holding the access credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Backblaze B2 backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct B2Spec {
    /// Bucket name
    pub bucket: String,

    /// Directory inside the bucket used by this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Maximum concurrent connections for upload/download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    /// Secret holding the access credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// REST server backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestServerSpec {
    /// Server URL
    pub url: String,

    /// Secret holding the access credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Backend configuration as written in manifests
///
/// `provider` selects which payload is active; the payload for that
/// provider must be present and every other payload absent.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// Storage provider
    pub provider: StorageProvider,

    /// Local volume configuration (provider: local)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,

    /// S3 configuration (provider: s3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,

    /// GCS configuration (provider: gcs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSpec>,

    /// Azure configuration (provider: azure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureSpec>,

    /// Swift configuration (provider: swift)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftSpec>,

    /// B2 configuration (provider: b2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<B2Spec>,

    /// REST server configuration (provider: rest)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestServerSpec>,
}

/// Validated backend: exactly one provider payload
#[derive(Clone, Debug, PartialEq)]
pub enum Backend {
    /// In-cluster volume
    Local(LocalSpec),
    /// S3 bucket
    S3(S3Spec),
    /// GCS bucket
    Gcs(GcsSpec),
    /// Azure Blob container
    Azure(AzureSpec),
    /// Swift container
    Swift(SwiftSpec),
    /// B2 bucket
    B2(B2Spec),
    /// REST server
    Rest(RestServerSpec),
}

/// Reasons a backend descriptor is rejected at admission
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendValidationError {
    /// More than one provider payload is populated
    #[error("multiple backend payloads set: {}", join_providers(.set))]
    MultipleVariantsSet {
        /// Providers whose payloads are populated
        set: Vec<StorageProvider>,
    },

    /// The payload for the tagged provider is absent
    #[error("provider '{provider}' requires the '{provider}' configuration block")]
    MissingVariant {
        /// The tagged provider
        provider: StorageProvider,
    },

    /// A mandatory field of the active payload is empty
    #[error("{provider} backend is missing required field '{field}'")]
    MissingRequiredField {
        /// The active provider
        provider: StorageProvider,
        /// Field path inside the payload (e.g., "bucket")
        field: &'static str,
    },

    /// The local volume source sets none or several volume kinds
    #[error("local backend must set exactly one volume source, found {found}")]
    InvalidVolumeSource {
        /// Number of populated volume kinds
        found: usize,
    },
}

fn join_providers(set: &[StorageProvider]) -> String {
    set.iter()
        .map(StorageProvider::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn require(
    provider: StorageProvider,
    field: &'static str,
    value: &str,
) -> Result<(), BackendValidationError> {
    if value.trim().is_empty() {
        return Err(BackendValidationError::MissingRequiredField { provider, field });
    }
    Ok(())
}

impl BackendSpec {
    /// Providers whose payloads are populated
    fn populated(&self) -> Vec<StorageProvider> {
        let flags = [
            (StorageProvider::Local, self.local.is_some()),
            (StorageProvider::S3, self.s3.is_some()),
            (StorageProvider::Gcs, self.gcs.is_some()),
            (StorageProvider::Azure, self.azure.is_some()),
            (StorageProvider::Swift, self.swift.is_some()),
            (StorageProvider::B2, self.b2.is_some()),
            (StorageProvider::Rest, self.rest.is_some()),
        ];
        flags
            .into_iter()
            .filter_map(|(provider, set)| set.then_some(provider))
            .collect()
    }

    /// Convert the wire form into the validated tagged union
    pub fn backend(&self) -> Result<Backend, BackendValidationError> {
        let populated = self.populated();
        if populated.len() > 1 {
            return Err(BackendValidationError::MultipleVariantsSet { set: populated });
        }

        let provider = self.provider;
        let missing = || BackendValidationError::MissingVariant { provider };

        let backend = match provider {
            StorageProvider::Local => {
                let local = self.local.clone().ok_or_else(missing)?;
                require(provider, "mountPath", &local.mount_path)?;
                let found = local.volume_source.populated();
                if found != 1 {
                    return Err(BackendValidationError::InvalidVolumeSource { found });
                }
                Backend::Local(local)
            }
            StorageProvider::S3 => {
                let s3 = self.s3.clone().ok_or_else(missing)?;
                require(provider, "bucket", &s3.bucket)?;
                Backend::S3(s3)
            }
            StorageProvider::Gcs => {
                let gcs = self.gcs.clone().ok_or_else(missing)?;
                require(provider, "bucket", &gcs.bucket)?;
                Backend::Gcs(gcs)
            }
            StorageProvider::Azure => {
                let azure = self.azure.clone().ok_or_else(missing)?;
                require(provider, "container", &azure.container)?;
                Backend::Azure(azure)
            }
            StorageProvider::Swift => {
                let swift = self.swift.clone().ok_or_else(missing)?;
                require(provider, "container", &swift.container)?;
                Backend::Swift(swift)
            }
            StorageProvider::B2 => {
                let b2 = self.b2.clone().ok_or_else(missing)?;
                require(provider, "bucket", &b2.bucket)?;
                Backend::B2(b2)
            }
            StorageProvider::Rest => {
                let rest = self.rest.clone().ok_or_else(missing)?;
                require(provider, "url", &rest.url)?;
                Backend::Rest(rest)
            }
        };

        Ok(backend)
    }

    /// Validate the descriptor without keeping the converted backend
    pub fn validate(&self) -> Result<(), BackendValidationError> {
        self.backend().map(|_| ())
    }
}

impl Backend {
    /// Provider tag of the active variant
    pub fn provider(&self) -> StorageProvider {
        match self {
            Self::Local(_) => StorageProvider::Local,
            Self::S3(_) => StorageProvider::S3,
            Self::Gcs(_) => StorageProvider::Gcs,
            Self::Azure(_) => StorageProvider::Azure,
            Self::Swift(_) => StorageProvider::Swift,
            Self::B2(_) => StorageProvider::B2,
            Self::Rest(_) => StorageProvider::Rest,
        }
    }
}

impl From<Backend> for BackendSpec {
    fn from(backend: Backend) -> Self {
        let mut spec = BackendSpec {
            provider: backend.provider(),
            local: None,
            s3: None,
            gcs: None,
            azure: None,
            swift: None,
            b2: None,
            rest: None,
        };
        match backend {
            Backend::Local(local) => spec.local = Some(local),
            Backend::S3(s3) => spec.s3 = Some(s3),
            Backend::Gcs(gcs) => spec.gcs = Some(gcs),
            Backend::Azure(azure) => spec.azure = Some(azure),
            Backend::Swift(swift) => spec.swift = Some(swift),
            Backend::B2(b2) => spec.b2 = Some(b2),
            Backend::Rest(rest) => spec.rest = Some(rest),
        }
        spec
    }
}

/// What happens to dependent data when a BackupStorage is deleted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Remove Repository and Snapshot objects, keep the backed-up data
    #[default]
    Delete,
    /// Remove Repository and Snapshot objects and the backed-up data
    WipeOut,
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => write!(f, "Delete"),
            Self::WipeOut => write!(f, "WipeOut"),
        }
    }
}

/// Lifecycle phase of a BackupStorage
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupStoragePhase {
    /// Registered and serving repositories
    #[default]
    Active,
    /// Delete requested, teardown in progress
    PendingDeletion,
    /// WipeOut teardown left unwiped paths behind; retried on the next pass
    WipeFailed,
    /// Teardown finished, the registration can be removed
    Deleted,
}

impl fmt::Display for BackupStoragePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::PendingDeletion => write!(f, "PendingDeletion"),
            Self::WipeFailed => write!(f, "WipeFailed"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A Repository using this BackupStorage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    /// Name of the Repository
    pub name: String,

    /// Namespace of the Repository
    #[serde(default)]
    pub namespace: String,

    /// Directory of the Repository, relative to the backend root
    #[serde(default)]
    pub path: String,

    /// Size of the backed-up data (e.g., "12.5 GiB")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,

    /// Whether the Repository state matches the backend
    #[serde(default)]
    pub synced: bool,

    /// Reason for the last sync failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepositoryInfo {
    /// `namespace/name` identity of the repository
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Status of a BackupStorage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: BackupStoragePhase,

    /// Whether every repository is synced without error
    #[serde(default)]
    pub ready: bool,

    /// Sum of all repository sizes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub total_size: String,

    /// Repositories using this storage
    #[serde(default)]
    pub repositories: Vec<RepositoryInfo>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Repository paths already wiped by an unfinished WipeOut deletion
    #[serde(default)]
    pub wiped_paths: Vec<String>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a BackupStorage
///
/// Usable from its own namespace, and from other namespaces when
/// `usagePolicy` allows. At most one default BackupStorage may apply to any
/// namespace; conflicting defaults are flagged with a `DefaultConflict`
/// condition on every storage involved.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "storage.lattice.dev",
    version = "v1alpha1",
    kind = "BackupStorage",
    plural = "backupstorages",
    shortname = "bs",
    namespaced,
    status = "BackupStorageStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.storage.provider"}"#,
    printcolumn = r#"{"name":"Default","type":"boolean","jsonPath":".spec.default"}"#,
    printcolumn = r#"{"name":"Deletion-Policy","type":"string","jsonPath":".spec.deletionPolicy"}"#,
    printcolumn = r#"{"name":"Total-Size","type":"string","jsonPath":".status.totalSize"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageSpec {
    /// Backend configuration
    pub storage: BackendSpec,

    /// Which other namespaces may use this storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_policy: Option<UsagePolicy>,

    /// Use this storage for repositories that don't name one
    #[serde(default)]
    pub default: bool,

    /// What to do with dependent data on deletion
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

/// Namespaced identity of a BackupStorage
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    /// Namespace of the BackupStorage
    pub namespace: String,
    /// Name of the BackupStorage
    pub name: String,
}

impl StorageKey {
    /// Build a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for StorageKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(format!("expected <namespace>/<name>, got '{}'", s)),
        }
    }
}

impl BackupStorage {
    /// Key of this object, if it carries a namespace
    pub fn storage_key(&self) -> Option<StorageKey> {
        self.namespace()
            .map(|namespace| StorageKey::new(namespace, self.name_any()))
    }
}
