// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::{Api, Client};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tugboat::config::Config;
use tugboat::constants::secrets;
use tugboat::kubernetes::{crd_yaml, wait_for_crd, KubeManagementApi, LeaderElector, ManagementApi};
use tugboat::providers::{TalosConnector, TalosctlConnector};
use tugboat::reconcilers::ClusterReconciler;
use tugboat::types::TalosCluster;
use tugboat::upgrade::{nodes_from_status, UpgradeOptions, UpgradeOrchestrator};

#[derive(Parser)]
#[command(name = "tugboat", version, about = "Talos Kubernetes clusters on Hetzner Cloud")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the operator (default)
    Run,
    /// Print the TalosCluster CRD
    Crd,
    /// Roll a cluster to a new Talos and/or Kubernetes version
    Upgrade(UpgradeArgs),
}

#[derive(Args)]
struct UpgradeArgs {
    /// Name of the TalosCluster
    cluster: String,
    #[arg(short, long, default_value = "default")]
    namespace: String,
    #[arg(long)]
    talos_version: Option<String>,
    #[arg(long)]
    kubernetes_version: Option<String>,
    /// Installer image, defaults to the stock image of --talos-version
    #[arg(long)]
    installer_image: Option<String>,
    /// Print the plan without changing anything
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    skip_health_check: bool,
    /// Stage the upgrade and apply it on the next reboot
    #[arg(long)]
    stage: bool,
    #[arg(long)]
    force: bool,
    #[arg(long, env = "TALOSCTL_PATH", default_value = "talosctl")]
    talosctl: PathBuf,
    #[arg(long, env = "STATE_DIR", default_value = "/tmp/tugboat")]
    state_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_operator().await,
        Command::Crd => {
            print!("{}", crd_yaml()?);
            Ok(())
        }
        Command::Upgrade(args) => run_upgrade(args).await,
    }
}

/// Cancel the token on ctrl-c
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            token.cancel();
        }
    });
    cancel
}

async fn run_operator() -> Result<()> {
    info!("Starting Tugboat operator");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: hcloud_endpoint={}, leader_election={}",
        config.hcloud_endpoint, config.leader_election
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = cancel_on_interrupt();

    info!("Waiting for TalosCluster CRD to become available...");
    wait_for_crd(&client, &shutdown).await?;

    // Cancelled on shutdown and when leadership is lost
    let active = shutdown.child_token();
    if config.leader_election {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &config.pod_namespace,
            &config.pod_name,
        ));
        elector.acquire(&shutdown).await?;
        elector.spawn_renewal(active.clone());
    }

    let reconciler = ClusterReconciler::new(client, &config, active.clone())?;
    info!("Starting cluster reconciler...");
    reconciler.run().await?;

    if active.is_cancelled() && !shutdown.is_cancelled() {
        bail!("leadership lost, exiting");
    }
    warn!("Cluster reconciler stopped");
    Ok(())
}

async fn run_upgrade(args: UpgradeArgs) -> Result<()> {
    let client = Client::try_default().await?;
    let clusters: Api<TalosCluster> = Api::namespaced(client.clone(), &args.namespace);
    let cluster = clusters
        .get(&args.cluster)
        .await
        .with_context(|| format!("TalosCluster {}/{} not found", args.namespace, args.cluster))?;
    let Some(status) = cluster.status.as_ref() else {
        bail!("TalosCluster {} has no status yet", args.cluster);
    };

    let management = KubeManagementApi::new(client);
    let talosconfig = management
        .get_secret_data(&args.namespace, &cluster.talos_secret_name())
        .await?
        .and_then(|mut data| data.remove(secrets::TALOSCONFIG_KEY))
        .with_context(|| format!("no talosconfig in secret {}", cluster.talos_secret_name()))?;

    let connector = TalosctlConnector::new(args.talosctl, args.state_dir);
    let talos = connector.connect(&args.namespace, &args.cluster, Some(talosconfig))?;
    let nodes = nodes_from_status(status);
    let options = UpgradeOptions {
        talos_version: args.talos_version,
        installer_image: args.installer_image,
        kubernetes_version: args.kubernetes_version,
        dry_run: args.dry_run,
        skip_health_check: args.skip_health_check,
        stage: args.stage,
        force: args.force,
    };

    let cancel = cancel_on_interrupt();
    let report = UpgradeOrchestrator::new(talos)
        .run(&nodes, &options, &cancel)
        .await?;

    println!("Plan:");
    for step in &report.plan {
        println!("  {}", step);
    }
    if !options.dry_run {
        println!("Upgraded: {}", report.upgraded.join(", "));
        println!("Already at target: {}", report.skipped.join(", "));
        println!("Kubernetes upgraded: {}", report.kubernetes_upgraded);
    }
    Ok(())
}
