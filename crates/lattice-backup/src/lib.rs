//! BackupStorage registry and usage policy engine for Lattice
//!
//! Everything needed to keep `BackupStorage` objects honest:
//!
//! - **backend**: resolves a validated backend descriptor into a location
//! - **usage_policy**: namespace admission and default-storage selection
//! - **size**: unit-aware byte sizes for repository totals
//! - **aggregator**: folds repositories into a published status
//! - **deletion**: `Delete` / `WipeOut` teardown against remote storage
//! - **registry**: the store that routes lifecycle events to the above
//! - **controller**: Kubernetes reconcile loop feeding the registry
//! - **kube_metadata**: Repository/Snapshot cleanup through the API server

pub mod aggregator;
pub mod backend;
pub mod controller;
pub mod deletion;
pub mod error;
pub mod kube_metadata;
pub mod registry;
pub mod remote;
pub mod size;
pub mod usage_policy;

pub use aggregator::{aggregate, RepositorySnapshot};
pub use backend::BackendLocation;
pub use controller::{error_policy, reconcile, Context, ControllerConfig, KubeStorageClient};
pub use deletion::{DeleteRequest, DeletionOutcome, WipeLedger};
pub use error::ReconcileError;
pub use kube_metadata::KubeMetadataStore;
pub use registry::{RegistryConfig, RepositoryEvent, StorageRegistry};
pub use remote::{MetadataStore, NoRemoteStorage, RemoteError, RemoteStorage};
pub use size::ByteSize;
pub use usage_policy::{NamespaceLabels, PolicyConflict};
