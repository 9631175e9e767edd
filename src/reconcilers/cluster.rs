// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cluster reconciler - watches TalosCluster resources and drives them
//! towards their spec, one provisioning pass per event.

use super::provision::Provisioner;
use super::status::estimate_remaining;
use crate::addons::AddonOrchestrator;
use crate::config::Config;
use crate::constants::reconcile::{ERROR_BACKOFF_BASE, ERROR_BACKOFF_MAX, PROVISIONING_REQUEUE};
use crate::constants::FINALIZER;
use crate::error::{Result, TugboatError};
use crate::kubernetes::{KubeManagementApi, ManagementApi};
use crate::providers::{CloudProvider, HcloudClient, HelmRenderer, TalosctlConnector};
use crate::types::{ProvisioningPhase, TalosCluster, TalosClusterStatus};
use chrono::Utc;
use futures::StreamExt;
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Error as FinalizerError, Event},
        watcher, Controller,
    },
    Api, Client, ResourceExt,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct ClusterReconciler {
    client: Client,
    provisioner: Provisioner,
    management: Arc<dyn ManagementApi>,
    cloud: Arc<dyn CloudProvider>,
    requeue_interval: Duration,
    cancel: CancellationToken,
    /// Consecutive failures per cluster, reset by a successful pass
    failures: Mutex<HashMap<String, u32>>,
}

impl ClusterReconciler {
    pub fn new(client: Client, config: &Config, cancel: CancellationToken) -> Result<Self> {
        let cloud: Arc<dyn CloudProvider> = Arc::new(HcloudClient::new(
            config.hcloud_endpoint.clone(),
            config.hcloud_token.clone(),
            cancel.clone(),
        )?);
        let management: Arc<dyn ManagementApi> = Arc::new(KubeManagementApi::new(client.clone()));
        let provisioner = Provisioner {
            cloud: Arc::clone(&cloud),
            talos: Arc::new(TalosctlConnector::new(
                config.talosctl_path.clone(),
                config.state_dir.clone(),
            )),
            management: Arc::clone(&management),
            renderer: Arc::new(HelmRenderer::new(config.helm_path.clone())),
            addons: Arc::new(AddonOrchestrator::builtin()?),
            hcloud_token: config.hcloud_token.clone(),
        };

        Ok(Self {
            client,
            provisioner,
            management,
            cloud,
            requeue_interval: config.requeue_interval,
            cancel,
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let clusters: Api<TalosCluster> = Api::all(self.client.clone());
        let shutdown = self.cancel.clone();
        let context = Arc::new(self);

        Controller::new(clusters, watcher::Config::default())
            .graceful_shutdown_on(async move { shutdown.cancelled().await })
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled cluster: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        info!("Cluster reconciler stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn apply(&self, cluster: Arc<TalosCluster>) -> Result<Action> {
        let status = self.provisioner.run(&cluster, &self.cancel).await?;

        if status_changed(cluster.status.as_ref(), &status) {
            self.management.patch_status(&cluster, &status).await?;
        }
        self.reset_failures(&cluster.name_any());

        if status.provisioning_phase == ProvisioningPhase::Complete {
            return Ok(Action::requeue(self.requeue_interval));
        }
        let remaining = estimate_remaining(&status, Utc::now());
        info!(
            "Cluster is in phase {}, about {}s until complete",
            status.provisioning_phase,
            remaining.as_secs()
        );
        Ok(Action::requeue(PROVISIONING_REQUEUE))
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    async fn cleanup(&self, cluster: Arc<TalosCluster>) -> Result<Action> {
        info!("TalosCluster deleted, tearing down cloud resources");
        teardown(self.cloud.as_ref(), &cluster).await?;
        self.reset_failures(&cluster.name_any());
        Ok(Action::await_change())
    }

    fn reset_failures(&self, name: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(name);
        }
    }

    fn record_failure(&self, name: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(name.to_string()).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 1,
        }
    }
}

async fn reconcile(cluster: Arc<TalosCluster>, ctx: Arc<ClusterReconciler>) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let clusters: Api<TalosCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    debug!("Reconciling cluster: {}", cluster.name_any());

    finalizer(&clusters, FINALIZER, cluster, move |event| async move {
        match event {
            Event::Apply(cluster) => ctx.apply(cluster).await,
            Event::Cleanup(cluster) => ctx.cleanup(cluster).await,
        }
    })
    .await
    .map_err(from_finalizer_error)
}

fn from_finalizer_error(error: FinalizerError<TugboatError>) -> TugboatError {
    match error {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
        FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => e.into(),
        FinalizerError::UnnamedObject => {
            TugboatError::ConfigError("TalosCluster has no name".to_string())
        }
        FinalizerError::InvalidFinalizer => {
            TugboatError::ConfigError(format!("invalid finalizer {}", FINALIZER))
        }
    }
}

fn error_policy(cluster: Arc<TalosCluster>, error: &TugboatError, ctx: Arc<ClusterReconciler>) -> Action {
    if matches!(error, TugboatError::Cancelled) {
        debug!("Reconciliation of {} cancelled", cluster.name_any());
        return Action::await_change();
    }
    let failures = ctx.record_failure(&cluster.name_any());
    let delay = backoff_delay(failures);
    error!(
        "Reconciliation of {} failed ({} in a row), retrying in {}s: {}",
        cluster.name_any(),
        failures,
        delay.as_secs(),
        error
    );
    Action::requeue(delay)
}

/// Exponential backoff after `failures` consecutive failed passes
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(ERROR_BACKOFF_MAX)
}

/// Whether the new status differs from the stored one in more than its
/// reconcile timestamp
fn status_changed(old: Option<&TalosClusterStatus>, new: &TalosClusterStatus) -> bool {
    let Some(old) = old else {
        return true;
    };
    let mut old = old.clone();
    old.last_reconcile_time = new.last_reconcile_time;
    old != *new
}

/// Delete every cloud resource of a cluster. Servers go first so the load
/// balancer, firewall and network are no longer in use. The Talos image is
/// shared and stays.
pub async fn teardown(cloud: &dyn CloudProvider, cluster: &TalosCluster) -> Result<()> {
    for server in cloud.get_servers_by_label(&cluster.server_selector()).await? {
        info!("Deleting server {}", server.name);
        cloud.delete_server(server.id).await?;
    }

    let Some(infra) = cluster.status.as_ref().map(|s| &s.infrastructure) else {
        return Ok(());
    };
    if let Some(id) = infra.load_balancer_id {
        cloud.delete_load_balancer(id).await?;
    }
    if let Some(id) = infra.firewall_id {
        cloud.delete_firewall(id).await?;
    }
    if let Some(id) = infra.network_id {
        cloud.delete_network(id).await?;
    }
    if let Some(id) = infra.placement_group_id {
        cloud.delete_placement_group(id).await?;
    }
    Ok(())
}
