//! Usage policy evaluation
//!
//! Decides whether a namespace may reference a BackupStorage and which
//! storage, if any, is the default for a namespace. Everything here is a
//! pure function of the storages passed in; the registry owns the state.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use lattice_common::crd::{BackupStorage, FromNamespaces, StorageKey, UsagePolicy};

/// Namespace labels, as used by `Selector` policies
pub type NamespaceLabels = BTreeMap<String, String>;

/// A usage policy invariant is violated
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PolicyConflict {
    /// More than one default BackupStorage applies to the namespace
    #[error(
        "multiple default BackupStorages apply to namespace '{namespace}': {}",
        join_keys(.candidates)
    )]
    MultipleDefaultsConflict {
        /// The namespace the defaults were computed for
        namespace: String,
        /// Every qualifying default, sorted
        candidates: Vec<StorageKey>,
    },
}

fn join_keys(keys: &[StorageKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Whether `requesting_namespace` may reference a storage declared in
/// `storage_namespace`.
///
/// Selector policies need namespace labels and never match here; use
/// [`is_permitted_with_labels`] when labels are known.
pub fn is_permitted(
    storage_namespace: &str,
    policy: Option<&UsagePolicy>,
    requesting_namespace: &str,
) -> bool {
    is_permitted_with_labels(storage_namespace, policy, requesting_namespace, None)
}

/// Like [`is_permitted`], also evaluating `Selector` policies against the
/// requesting namespace's labels
pub fn is_permitted_with_labels(
    storage_namespace: &str,
    policy: Option<&UsagePolicy>,
    requesting_namespace: &str,
    namespace_labels: Option<&NamespaceLabels>,
) -> bool {
    if storage_namespace == requesting_namespace {
        return true;
    }

    let Some(policy) = policy else {
        return false;
    };

    match policy.allowed_namespaces.from {
        FromNamespaces::All => true,
        FromNamespaces::Same => policy.lists(requesting_namespace),
        FromNamespaces::Selector => {
            if policy.lists(requesting_namespace) {
                return true;
            }
            match (&policy.allowed_namespaces.selector, namespace_labels) {
                (Some(selector), Some(labels)) => selector.matches(labels),
                _ => false,
            }
        }
    }
}

/// Whether `storage` may be used from `namespace`
pub fn storage_permits(
    storage: &BackupStorage,
    namespace: &str,
    namespace_labels: Option<&NamespaceLabels>,
) -> bool {
    let storage_namespace = storage.metadata.namespace.as_deref().unwrap_or_default();
    is_permitted_with_labels(
        storage_namespace,
        storage.spec.usage_policy.as_ref(),
        namespace,
        namespace_labels,
    )
}

/// Pick the default storage for `for_namespace`.
///
/// Only storages with `default = true` that permit the namespace qualify.
/// Two or more qualifying storages are a conflict; the result does not
/// depend on the order of `candidates`.
pub fn select_default<'a>(
    candidates: &'a [BackupStorage],
    for_namespace: &str,
    namespace_labels: Option<&NamespaceLabels>,
) -> Result<Option<&'a BackupStorage>, PolicyConflict> {
    let mut qualifying: Vec<(StorageKey, &BackupStorage)> = candidates
        .iter()
        .filter(|s| s.spec.default && storage_permits(s, for_namespace, namespace_labels))
        .filter_map(|s| s.storage_key().map(|key| (key, s)))
        .collect();
    qualifying.sort_by(|a, b| a.0.cmp(&b.0));
    qualifying.dedup_by(|a, b| a.0 == b.0);

    match qualifying.len() {
        0 => Ok(None),
        1 => Ok(qualifying.pop().map(|(_, storage)| storage)),
        _ => Err(PolicyConflict::MultipleDefaultsConflict {
            namespace: for_namespace.to_string(),
            candidates: qualifying.into_iter().map(|(key, _)| key).collect(),
        }),
    }
}

/// Storages involved in a default conflict, with the namespaces they conflict in
pub type DefaultConflicts = BTreeMap<StorageKey, BTreeSet<String>>;

/// Scan every known namespace for default conflicts.
///
/// The declaring namespaces of the storages are always scanned in addition
/// to `known_namespaces`. Storages with `from: All` conflict in every
/// scanned namespace they share with another default.
pub fn default_conflicts<'a, I>(
    storages: &[BackupStorage],
    known_namespaces: I,
) -> DefaultConflicts
where
    I: IntoIterator<Item = (&'a str, Option<&'a NamespaceLabels>)>,
{
    let mut namespaces: BTreeMap<String, Option<&NamespaceLabels>> = known_namespaces
        .into_iter()
        .map(|(ns, labels)| (ns.to_string(), labels))
        .collect();
    for storage in storages.iter().filter(|s| s.spec.default) {
        if let Some(ns) = storage.metadata.namespace.as_deref() {
            namespaces.entry(ns.to_string()).or_insert(None);
        }
        if let Some(policy) = &storage.spec.usage_policy {
            for ns in &policy.allowed_namespaces.namespaces {
                namespaces.entry(ns.clone()).or_insert(None);
            }
        }
    }

    let mut conflicts = DefaultConflicts::new();
    for (namespace, labels) in &namespaces {
        if let Err(PolicyConflict::MultipleDefaultsConflict { candidates, .. }) =
            select_default(storages, namespace, *labels)
        {
            for key in candidates {
                conflicts.entry(key).or_default().insert(namespace.clone());
            }
        }
    }
    conflicts
}
