//! Kubernetes helpers shared by the storage controllers

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};

/// Merge-patch body replacing `status`
pub fn status_patch(status: &impl serde::Serialize) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch. The whole status is sent every time, so readers never
/// observe a partially written status. Lists must serialize even when
/// empty: an absent key leaves the stored list untouched under merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_patch(status);
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Check whether an object carries the given finalizer
pub fn has_finalizer<T: Resource>(obj: &T, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Finalizer list with `finalizer` added (no duplicates)
pub fn with_finalizer(current: &[String], finalizer: &str) -> Vec<String> {
    let mut finalizers = current.to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizer list with `finalizer` removed
pub fn without_finalizer(current: &[String], finalizer: &str) -> Vec<String> {
    current
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect()
}

/// Replace the finalizer list of a namespaced resource via merge-patch
pub async fn patch_finalizers<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizers: Vec<String>,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Whether a kube error is a 404 Not Found
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
