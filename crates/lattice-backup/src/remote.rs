//! Collaborators at the edge of the engine
//!
//! The engine never talks to object stores or the API server directly.
//! Deletion goes through these traits so the executor can be driven by a
//! kube-backed implementation in the controller and by mocks in tests.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use lattice_common::crd::{RepositoryInfo, StorageKey};

use crate::backend::BackendLocation;

/// Failure reported by a remote storage backend
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The backend could not be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete in time
    #[error("timed out after {secs}s")]
    Timeout {
        /// Bound that was exceeded
        secs: u64,
    },

    /// Credentials were rejected or lack permission
    #[error("access denied: {0}")]
    Denied(String),

    /// Any other failure
    #[error("{0}")]
    Other(String),
}

/// Destructive operations on backed-up data
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Delete everything under `path` in the backend.
    ///
    /// `path` is relative to the location root and never empty.
    ///
    /// Must succeed when the path is already empty or absent.
    async fn wipe(&self, location: &BackendLocation, path: &str) -> Result<(), RemoteError>;
}

/// Metadata objects that depend on a BackupStorage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Remove the Repository objects (and their snapshots) bound to `storage`
    async fn remove_dependents(
        &self,
        storage: &StorageKey,
        repositories: &[RepositoryInfo],
    ) -> Result<(), lattice_common::Error>;

    /// Point the given repositories at `successor` instead of `storage`
    async fn reassign(
        &self,
        storage: &StorageKey,
        successor: &StorageKey,
        repositories: &[RepositoryInfo],
    ) -> Result<(), lattice_common::Error>;
}

/// Remote storage for deployments that never wipe data.
///
/// Every wipe is refused, so a `WipeOut` deletion stays in `WipeFailed`
/// until a real backend client is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRemoteStorage;

#[async_trait]
impl RemoteStorage for NoRemoteStorage {
    async fn wipe(&self, location: &BackendLocation, path: &str) -> Result<(), RemoteError> {
        Err(RemoteError::Unavailable(format!(
            "no {} client configured to wipe {}",
            location.provider,
            location.join(path)
        )))
    }
}
