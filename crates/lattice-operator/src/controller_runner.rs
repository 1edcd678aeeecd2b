//! Controller runner - builds the BackupStorage controller future
//!
//! Construction is kept separate from `main` so the wiring of watches and
//! the repository-to-storage mapping can be tested without a cluster.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use lattice_backup::{error_policy, reconcile, Context};
use lattice_common::crd::{BackupStorage, Repository};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// The BackupStorage a Repository event should wake up
pub fn storage_for_repository(repository: &Repository) -> Option<ObjectRef<BackupStorage>> {
    let namespace = repository.namespace()?;
    let key = repository.spec.storage_ref.key(&namespace);
    Some(ObjectRef::new(&key.name).within(&key.namespace))
}

/// Build the BackupStorage controller future
pub fn build_storage_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let namespace = ctx.config.watch_namespace.clone();
    let storages: Api<BackupStorage> = api_for(&client, namespace.as_deref());
    let repositories: Api<Repository> = api_for(&client, namespace.as_deref());

    match namespace.as_deref() {
        Some(ns) => tracing::info!(namespace = %ns, "- BackupStorage controller"),
        None => tracing::info!("- BackupStorage controller (all namespaces)"),
    }

    Box::pin(
        Controller::new(storages, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .watches(
                repositories,
                WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
                |repository| storage_for_repository(&repository),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("BackupStorage")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
