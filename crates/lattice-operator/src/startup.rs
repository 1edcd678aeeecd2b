//! CRD installation on startup
//!
//! The operator applies its own CRDs with server-side apply so that the
//! schema in the cluster always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use lattice_common::crd::{BackupStorage, Repository};
use lattice_common::Error;

const FIELD_MANAGER: &str = "lattice-storage-controller";

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn storage_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "backupstorages.storage.lattice.dev",
            crd: BackupStorage::crd(),
        },
        CrdDef {
            name: "repositories.storage.lattice.dev",
            crd: Repository::crd(),
        },
    ]
}

/// Multi-document YAML of every CRD served by the operator
pub fn crd_manifests() -> Result<String, Error> {
    let docs = storage_crds()
        .into_iter()
        .map(|def| render_crd(&def))
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(docs.join("---\n"))
}

fn render_crd(def: &CrdDef) -> Result<String, Error> {
    serde_yaml::to_string(&def.crd).map_err(|e| {
        Error::serialization_for_kind("CustomResourceDefinition", format!("{}: {}", def.name, e))
    })
}

/// Ensure the BackupStorage and Repository CRDs are installed
pub async fn ensure_storage_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in storage_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("Storage CRDs installed/updated");
    Ok(())
}
