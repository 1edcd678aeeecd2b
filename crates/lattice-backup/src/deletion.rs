//! Deletion policy execution
//!
//! Runs when a BackupStorage is deleted:
//!
//! - **Delete**: dependent metadata is removed, backed-up data is kept.
//! - **WipeOut**: every repository path is wiped in the backend first, then
//!   the metadata is removed. Paths confirmed wiped are recorded in a
//!   [`WipeLedger`] so a retry only touches what is left.
//!
//! Deletion is blocked while repositories are attached unless the request
//! cascades to them or names a successor that takes them over.
//!
//! Repository paths are wiped relative to the backend root with surrounding
//! slashes trimmed; a path that trims to nothing is never wiped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use lattice_common::crd::{DeletionPolicy, RepositoryInfo, StorageKey};

use crate::backend::BackendLocation;
use crate::remote::{MetadataStore, RemoteError, RemoteStorage};

/// Default bound on a single wipe call
pub const DEFAULT_WIPE_TIMEOUT: Duration = Duration::from_secs(300);

/// How a delete should treat attached repositories
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Remove (or wipe) attached repositories along with the storage
    pub cascade: bool,
    /// Storage that takes over attached repositories
    pub successor: Option<StorageKey>,
}

impl Default for DeleteRequest {
    fn default() -> Self {
        Self {
            cascade: true,
            successor: None,
        }
    }
}

impl DeleteRequest {
    /// Keep attached repositories: deletion waits until they are gone
    pub fn retain() -> Self {
        Self {
            cascade: false,
            successor: None,
        }
    }

    /// Hand attached repositories over to `successor`
    pub fn reassign_to(successor: StorageKey) -> Self {
        Self {
            cascade: false,
            successor: Some(successor),
        }
    }
}

/// Repository path relative to the backend root
pub fn wipe_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Progress of a WipeOut deletion
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WipeLedger {
    confirmed: BTreeSet<String>,
}

impl WipeLedger {
    /// Ledger resuming an earlier attempt that already wiped `confirmed`.
    ///
    /// Any other path, including one attached after that attempt, still
    /// needs a wipe.
    pub fn resume<I, S>(confirmed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            confirmed: confirmed
                .into_iter()
                .map(|p| wipe_path(p.as_ref()).to_string())
                .collect(),
        }
    }

    /// Record a path as wiped
    pub fn confirm(&mut self, path: &str) {
        self.confirmed.insert(wipe_path(path).to_string());
    }

    /// Whether `path` still has to be wiped
    pub fn needs_wipe(&self, path: &str) -> bool {
        !self.confirmed.contains(wipe_path(path))
    }

    /// Paths confirmed wiped so far
    pub fn confirmed(&self) -> impl Iterator<Item = &str> {
        self.confirmed.iter().map(String::as_str)
    }

    /// Repositories whose paths are not yet wiped, sorted by path
    pub fn remaining(&self, repositories: &[RepositoryInfo]) -> Vec<RepositoryInfo> {
        let mut remaining: Vec<RepositoryInfo> = repositories
            .iter()
            .filter(|r| self.needs_wipe(&r.path))
            .cloned()
            .collect();
        remaining.sort_by(|a, b| {
            (&a.path, &a.namespace, &a.name).cmp(&(&b.path, &b.namespace, &b.name))
        });
        remaining
    }
}

/// What a deletion attempt achieved
#[derive(Debug)]
pub enum DeletionOutcome {
    /// Repositories are attached and the request neither cascades nor
    /// names a successor
    Blocked {
        /// Attached repositories (`namespace/name`)
        attached: Vec<String>,
    },

    /// Teardown finished; the registration can be removed
    Deleted,

    /// Some paths could not be wiped
    WipeFailed {
        /// Repositories whose paths are not confirmed wiped
        remaining: Vec<RepositoryInfo>,
        /// Failure per path
        failures: BTreeMap<String, RemoteError>,
    },

    /// Dependent metadata could not be removed or reassigned
    MetadataFailed(lattice_common::Error),
}

/// The storage being torn down
#[derive(Clone, Copy, Debug)]
pub struct DeletionTarget<'a> {
    /// Storage identity
    pub key: &'a StorageKey,
    /// Policy from the storage spec
    pub policy: DeletionPolicy,
    /// Resolved backend location
    pub location: &'a BackendLocation,
    /// Repositories currently attached
    pub repositories: &'a [RepositoryInfo],
}

/// Executes deletion policies against the remote and metadata collaborators
pub struct DeletionExecutor {
    remote: Arc<dyn RemoteStorage>,
    metadata: Arc<dyn MetadataStore>,
    wipe_timeout: Duration,
}

impl DeletionExecutor {
    /// Create an executor with the given collaborators
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        metadata: Arc<dyn MetadataStore>,
        wipe_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            metadata,
            wipe_timeout,
        }
    }

    /// Run one deletion attempt.
    ///
    /// `ledger` is updated after every confirmed wipe, so an attempt that is
    /// interrupted or fails part way resumes where it stopped.
    pub async fn execute(
        &self,
        target: DeletionTarget<'_>,
        request: &DeleteRequest,
        ledger: &mut WipeLedger,
    ) -> DeletionOutcome {
        let key = target.key;
        let attached = target.repositories;

        if !attached.is_empty() && !request.cascade && request.successor.is_none() {
            let attached: Vec<String> = attached.iter().map(|r| r.qualified_name()).collect();
            info!(backup_storage = %key, attached = attached.len(), "deletion blocked by attached repositories");
            return DeletionOutcome::Blocked { attached };
        }

        if let Some(successor) = request.successor.as_ref().filter(|_| !attached.is_empty()) {
            info!(
                backup_storage = %key,
                successor = %successor,
                repositories = attached.len(),
                "reassigning repositories to successor"
            );
            return match self.metadata.reassign(key, successor, attached).await {
                Ok(()) => DeletionOutcome::Deleted,
                Err(e) => {
                    warn!(backup_storage = %key, error = %e, "failed to reassign repositories");
                    DeletionOutcome::MetadataFailed(e)
                }
            };
        }

        if target.policy == DeletionPolicy::WipeOut {
            let failures = self.wipe_remaining(&target, ledger).await;
            if !failures.is_empty() {
                return DeletionOutcome::WipeFailed {
                    remaining: ledger.remaining(attached),
                    failures,
                };
            }
        }

        if attached.is_empty() {
            return DeletionOutcome::Deleted;
        }

        match self.metadata.remove_dependents(key, attached).await {
            Ok(()) => {
                info!(backup_storage = %key, repositories = attached.len(), "removed dependent metadata");
                DeletionOutcome::Deleted
            }
            Err(e) => {
                warn!(backup_storage = %key, error = %e, "failed to remove dependent metadata");
                DeletionOutcome::MetadataFailed(e)
            }
        }
    }

    /// Wipe every path the ledger still needs, in path order
    async fn wipe_remaining(
        &self,
        target: &DeletionTarget<'_>,
        ledger: &mut WipeLedger,
    ) -> BTreeMap<String, RemoteError> {
        let paths: BTreeSet<String> = ledger
            .remaining(target.repositories)
            .into_iter()
            .map(|r| wipe_path(&r.path).to_string())
            .collect();

        let mut failures = BTreeMap::new();
        for path in paths {
            if path.is_empty() {
                warn!(
                    backup_storage = %target.key,
                    root = %target.location.root_path,
                    "repository path resolves to the backend root, not wiping"
                );
                failures.insert(
                    path,
                    RemoteError::Other("refusing to wipe the backend root".to_string()),
                );
                continue;
            }

            let wipe = self.remote.wipe(target.location, &path);
            let result = match tokio::time::timeout(self.wipe_timeout, wipe).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout {
                    secs: self.wipe_timeout.as_secs(),
                }),
            };

            match result {
                Ok(()) => {
                    debug!(backup_storage = %target.key, path = %path, "path wiped");
                    ledger.confirm(&path);
                }
                Err(e) => {
                    warn!(
                        backup_storage = %target.key,
                        path = %target.location.join(&path),
                        error = %e,
                        "wipe failed"
                    );
                    failures.insert(path, e);
                }
            }
        }
        failures
    }
}
