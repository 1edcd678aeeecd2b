//! Common types for Lattice backup storage: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the storage CRDs
pub const STORAGE_API_GROUP: &str = "storage.lattice.dev";

/// Finalizer that holds a BackupStorage until its deletion policy has run
pub const STORAGE_FINALIZER: &str = "storage.lattice.dev/deletion";

/// Annotation naming the successor BackupStorage (`namespace/name`) that
/// takes over attached repositories when this one is deleted
pub const SUCCESSOR_ANNOTATION: &str = "storage.lattice.dev/successor";

/// Annotation that, when `"true"`, blocks deletion while repositories are
/// attached instead of removing them
pub const RETAIN_REPOSITORIES_ANNOTATION: &str = "storage.lattice.dev/retain-repositories";

/// Requeue interval after a successful reconcile (5 minutes)
pub const REQUEUE_SUCCESS_SECS: u64 = 300;

/// Requeue interval after a failed reconcile (30 seconds)
pub const REQUEUE_ERROR_SECS: u64 = 30;

/// Requeue interval while deletion waits for dependents or a retried wipe
pub const REQUEUE_DELETION_SECS: u64 = 15;
