//! Backend location resolution
//!
//! Translates a validated [`Backend`] into the provider-neutral
//! [`BackendLocation`] handed to storage clients. This is the only place
//! that branches on the provider; everything downstream works with the
//! resolved location.

use lattice_common::crd::{Backend, BackendSpec, BackendValidationError, StorageProvider};

/// Provider-neutral address of a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendLocation {
    /// Provider of the backend
    pub provider: StorageProvider,
    /// Bucket, container, server URL or mount path
    pub location: String,
    /// Directory under `location` owned by this backend
    pub prefix: Option<String>,
    /// Fully qualified root, e.g. `s3://bucket/prefix`
    pub root_path: String,
    /// Secret holding access credentials, resolved by the caller
    pub credential_ref: Option<String>,
    /// Upper bound on concurrent connections, when the provider supports one
    pub max_connections: Option<u32>,
    /// Custom endpoint (S3-compatible stores)
    pub endpoint: Option<String>,
    /// Region of the bucket (S3)
    pub region: Option<String>,
}

impl BackendLocation {
    /// Absolute address of `path` under the backend root
    pub fn join(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.root_path.clone()
        } else {
            format!("{}/{}", self.root_path, path)
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn clean_prefix(prefix: &Option<String>) -> Option<String> {
    non_empty(prefix)
        .map(|p| p.trim_matches('/').to_string())
        .filter(|p| !p.is_empty())
}

fn root(scheme: &str, location: &str, prefix: Option<&str>) -> String {
    let base = format!("{}{}", scheme, location.trim_end_matches('/'));
    match prefix {
        Some(prefix) => format!("{}/{}", base, prefix),
        None => base,
    }
}

/// Resolve a validated backend into its location
pub fn resolve(backend: &Backend) -> BackendLocation {
    let provider = backend.provider();

    let (scheme, location, prefix, credential_ref, max_connections, endpoint, region) =
        match backend {
            Backend::Local(local) => (
                "",
                local.mount_path.clone(),
                clean_prefix(&local.sub_path),
                None,
                None,
                None,
                None,
            ),
            Backend::S3(s3) => (
                "s3://",
                s3.bucket.clone(),
                clean_prefix(&s3.prefix),
                non_empty(&s3.secret),
                None,
                non_empty(&s3.endpoint),
                non_empty(&s3.region),
            ),
            Backend::Gcs(gcs) => (
                "gs://",
                gcs.bucket.clone(),
                clean_prefix(&gcs.prefix),
                non_empty(&gcs.secret),
                gcs.max_connections,
                None,
                None,
            ),
            Backend::Azure(azure) => (
                "azure://",
                azure.container.clone(),
                clean_prefix(&azure.prefix),
                non_empty(&azure.secret),
                azure.max_connections,
                None,
                None,
            ),
            Backend::Swift(swift) => (
                "swift://",
                swift.container.clone(),
                clean_prefix(&swift.prefix),
                non_empty(&swift.secret),
                None,
                None,
                None,
            ),
            Backend::B2(b2) => (
                "b2://",
                b2.bucket.clone(),
                clean_prefix(&b2.prefix),
                non_empty(&b2.secret),
                b2.max_connections,
                None,
                None,
            ),
            Backend::Rest(rest) => (
                "",
                rest.url.clone(),
                None,
                non_empty(&rest.secret),
                None,
                None,
                None,
            ),
        };

    let location = location.trim().to_string();

    BackendLocation {
        provider,
        root_path: root(scheme, &location, prefix.as_deref()),
        location,
        prefix,
        credential_ref,
        max_connections: max_connections.filter(|n| *n > 0),
        endpoint,
        region,
    }
}

/// Validate a wire-form descriptor and resolve it
pub fn resolve_spec(spec: &BackendSpec) -> Result<BackendLocation, BackendValidationError> {
    spec.backend().map(|backend| resolve(&backend))
}
