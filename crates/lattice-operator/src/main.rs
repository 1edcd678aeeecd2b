//! Lattice storage operator - BackupStorage registry and usage policy engine

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;

use lattice_backup::{
    Context, KubeMetadataStore, KubeStorageClient, NoRemoteStorage, StorageRegistry,
};
use lattice_common::telemetry::init_telemetry;
use lattice_operator::config::OperatorConfig;
use lattice_operator::controller_runner::build_storage_controller;
use lattice_operator::startup::{crd_manifests, ensure_storage_crds};

/// Lattice storage operator - manages BackupStorage registrations
#[derive(Parser, Debug)]
#[command(name = "lattice-storage-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches BackupStorage and Repository objects, publishes aggregate
    /// status and runs deletion policies behind a finalizer.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(&cli.config.telemetry())
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli.config).await,
    }
}

async fn run_controller(config: &OperatorConfig) -> anyhow::Result<()> {
    tracing::info!("Lattice storage controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_storage_crds(&client).await?;

    // Remote wipes are refused until an object-store client is wired in
    let registry = Arc::new(StorageRegistry::new(
        config.registry(),
        Arc::new(NoRemoteStorage),
        Arc::new(KubeMetadataStore::new(client.clone())),
    ));
    let controller_config = config.controller();
    let kube = Arc::new(KubeStorageClient::new(
        client.clone(),
        controller_config.watch_namespace.clone(),
    ));
    let ctx = Arc::new(Context::new(kube, registry.clone(), controller_config));

    tracing::info!("Starting controllers:");
    build_storage_controller(client, ctx).await;

    tracing::info!("Controller stopped, draining registry");
    registry.shutdown().await;
    Ok(())
}
