//! Repository aggregation
//!
//! Folds the repositories bound to one BackupStorage into its published
//! status: one entry per repository, the total size, readiness and the
//! conditions derived from them.

use std::collections::BTreeMap;

use lattice_common::crd::{
    remove_condition, set_condition, BackupStorageStatus, Condition, ConditionStatus,
    RepositoryInfo, CONDITION_REPOSITORY_SIZE_INVALID, CONDITION_REPOSITORY_SYNC_FAILED,
};

use crate::size::{self, ByteSize};

/// Observed state of one repository, as delivered by lifecycle events
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositorySnapshot {
    /// Repository name
    pub name: String,
    /// Repository namespace
    pub namespace: String,
    /// Directory under the backend root
    pub path: String,
    /// Reported size, possibly empty
    pub size: String,
    /// Whether the repository matches the backend
    pub synced: bool,
    /// Last sync error
    pub error: Option<String>,
}

impl RepositorySnapshot {
    /// `(namespace, name)` key of the repository
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.name.clone())
    }
}

impl From<RepositorySnapshot> for RepositoryInfo {
    fn from(snapshot: RepositorySnapshot) -> Self {
        RepositoryInfo {
            name: snapshot.name,
            namespace: snapshot.namespace,
            path: snapshot.path,
            size: snapshot.size,
            synced: snapshot.synced,
            error: snapshot.error,
        }
    }
}

impl From<&RepositoryInfo> for RepositorySnapshot {
    fn from(info: &RepositoryInfo) -> Self {
        RepositorySnapshot {
            name: info.name.clone(),
            namespace: info.namespace.clone(),
            path: info.path.clone(),
            size: info.size.clone(),
            synced: info.synced,
            error: info.error.clone(),
        }
    }
}

/// Build the status for a set of repository snapshots.
///
/// Entries are keyed by (namespace, name); when a key repeats, the later
/// snapshot wins. Conditions other than the ones owned here are carried
/// over from `previous_conditions` untouched.
pub fn aggregate(
    snapshots: &[RepositorySnapshot],
    previous_conditions: &[Condition],
) -> BackupStorageStatus {
    let entries: BTreeMap<(String, String), &RepositorySnapshot> =
        snapshots.iter().map(|s| (s.key(), s)).collect();

    let mut total = ByteSize::ZERO;
    let mut invalid_sizes = Vec::new();
    let mut failed = Vec::new();
    let mut ready = true;

    let repositories: Vec<RepositoryInfo> = entries
        .into_values()
        .map(|snapshot| {
            let info = RepositoryInfo::from(snapshot.clone());

            if !info.size.trim().is_empty() {
                match size::parse(&info.size) {
                    Ok(bytes) => total = total + bytes,
                    Err(_) => invalid_sizes.push(info.qualified_name()),
                }
            }
            if info.error.is_some() {
                failed.push(info.qualified_name());
            }
            ready &= info.synced && info.error.is_none();

            info
        })
        .collect();

    let mut conditions = previous_conditions.to_vec();

    if failed.is_empty() {
        remove_condition(&mut conditions, CONDITION_REPOSITORY_SYNC_FAILED);
    } else {
        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_REPOSITORY_SYNC_FAILED,
                ConditionStatus::True,
                "SyncFailed",
                format!("repositories failing to sync: {}", failed.join(", ")),
            ),
        );
    }

    if invalid_sizes.is_empty() {
        remove_condition(&mut conditions, CONDITION_REPOSITORY_SIZE_INVALID);
    } else {
        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_REPOSITORY_SIZE_INVALID,
                ConditionStatus::True,
                "UnparseableSize",
                format!(
                    "sizes counted as zero for: {}",
                    invalid_sizes.join(", ")
                ),
            ),
        );
    }

    BackupStorageStatus {
        ready,
        total_size: size::format(total),
        repositories,
        conditions,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::crd::{find_condition, CONDITION_DEFAULT_CONFLICT};

    fn snapshot(name: &str, size: &str, synced: bool, error: Option<&str>) -> RepositorySnapshot {
        RepositorySnapshot {
            name: name.to_string(),
            namespace: "ns-a".to_string(),
            path: format!("/{}", name.trim_end_matches("-repo")),
            size: size.to_string(),
            synced,
            error: error.map(str::to_string),
        }
    }

    /// Story: one healthy and one failing repository
    ///
    /// The failure is visible through a condition while the healthy entry
    /// still counts towards the total.
    #[test]
    fn story_partial_failure_is_visible() {
        let status = aggregate(
            &[
                snapshot("db-repo", "2 GiB", true, None),
                snapshot("log-repo", "512 MiB", false, Some("timeout")),
            ],
            &[],
        );

        assert_eq!(status.total_size, "2.5 GiB");
        assert!(!status.ready);
        assert_eq!(status.repositories.len(), 2);
        assert_eq!(status.repositories[0].path, "/db");

        let failed: Vec<_> = status
            .conditions
            .iter()
            .filter(|c| c.type_ == CONDITION_REPOSITORY_SYNC_FAILED)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].message.contains("log-repo"));
        assert!(!failed[0].message.contains("db-repo"));
    }

    #[test]
    fn test_empty_set_is_ready() {
        let status = aggregate(&[], &[]);
        assert!(status.ready);
        assert_eq!(status.total_size, "0 B");
        assert!(status.repositories.is_empty());
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn test_unsynced_without_error_is_not_ready_but_not_failed() {
        let status = aggregate(&[snapshot("db-repo", "1 GiB", false, None)], &[]);
        assert!(!status.ready);
        assert!(find_condition(&status.conditions, CONDITION_REPOSITORY_SYNC_FAILED).is_none());
    }

    /// Story: aggregation is idempotent and ignores input order
    #[test]
    fn story_idempotent_and_order_independent() {
        let a = snapshot("db-repo", "2 GiB", true, None);
        let b = snapshot("log-repo", "512 MiB", false, Some("timeout"));

        let first = aggregate(&[a.clone(), b.clone()], &[]);
        let second = aggregate(&[b, a], &first.conditions);
        let third = aggregate(
            &second
                .repositories
                .iter()
                .map(RepositorySnapshot::from)
                .collect::<Vec<_>>(),
            &second.conditions,
        );

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&third).unwrap()
        );
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let status = aggregate(
            &[
                snapshot("db-repo", "1 GiB", false, Some("old")),
                snapshot("db-repo", "2 GiB", true, None),
            ],
            &[],
        );
        assert_eq!(status.repositories.len(), 1);
        assert_eq!(status.total_size, "2 GiB");
        assert!(status.ready);
    }

    #[test]
    fn test_invalid_and_empty_sizes() {
        let status = aggregate(
            &[
                snapshot("a-repo", "", true, None),
                snapshot("b-repo", "huge", true, None),
                snapshot("c-repo", "1 KiB", true, None),
            ],
            &[],
        );

        assert_eq!(status.total_size, "1 KiB");
        assert!(status.ready);
        let condition =
            find_condition(&status.conditions, CONDITION_REPOSITORY_SIZE_INVALID).unwrap();
        assert!(condition.message.contains("ns-a/b-repo"));
        assert!(!condition.message.contains("c-repo"));
    }

    #[test]
    fn test_recovery_clears_owned_conditions_and_keeps_others() {
        let failing = aggregate(&[snapshot("db-repo", "1 GiB", true, Some("denied"))], &[]);
        let mut previous = failing.conditions.clone();
        set_condition(
            &mut previous,
            Condition::new(CONDITION_DEFAULT_CONFLICT, ConditionStatus::True, "r", "m"),
        );

        let healthy = aggregate(&[snapshot("db-repo", "1 GiB", true, None)], &previous);
        assert!(healthy.ready);
        assert!(find_condition(&healthy.conditions, CONDITION_REPOSITORY_SYNC_FAILED).is_none());
        assert!(find_condition(&healthy.conditions, CONDITION_DEFAULT_CONFLICT).is_some());
    }
}
