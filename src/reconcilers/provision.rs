// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One reconcile pass over a TalosCluster.
//!
//! A pass re-derives every node phase from live observation, runs the
//! actions gated by the current macro-phase, and advances the macro-phase by
//! at most one step. Nothing is carried over in memory between passes; the
//! returned status is the only output.

use super::status::{
    advance_phase, apply_node_phase, derive_cluster_phase, ensure_phase_open, mark_phase_error,
    record_error, update_ready_counts,
};
use crate::addons::{AddonContext, AddonOrchestrator, AddonScope};
use crate::constants::{labels, secrets};
use crate::error::{Result, TugboatError};
use crate::kubernetes::{ManagementApi, WorkloadApi};
use crate::nodes::{resolve, ClusterObserver, NodeObserver, Observation};
use crate::providers::hcloud::{CreateServerRequest, LoadBalancerRequest, NetworkRequest};
use crate::providers::talos::ConfigRequest;
use crate::providers::{CloudProvider, ManifestRenderer, TalosApi, TalosConnector};
use crate::types::cluster::PlannedNode;
use crate::types::{
    AddonPhase, NodePhase, NodeRole, NodeStatus, ProvisioningPhase, TalosCluster,
    TalosClusterStatus,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Secrets and API handles a pass works with. Updated in place when the pass
/// creates a secret.
pub struct Connections {
    pub talos: Arc<dyn TalosApi>,
    pub workload: Option<Arc<dyn WorkloadApi>>,
    pub talos_config: Option<BTreeMap<String, String>>,
    pub kubeconfig: Option<String>,
}

pub struct Provisioner {
    pub cloud: Arc<dyn CloudProvider>,
    pub talos: Arc<dyn TalosConnector>,
    pub management: Arc<dyn ManagementApi>,
    pub renderer: Arc<dyn ManifestRenderer>,
    pub addons: Arc<AddonOrchestrator>,
    pub hcloud_token: String,
}

impl Provisioner {
    /// Full pass: load secrets, connect, observe, act.
    pub async fn run(&self, cluster: &TalosCluster, cancel: &CancellationToken) -> Result<TalosClusterStatus> {
        let mut conns = self.connect(cluster).await?;
        let observer = ClusterObserver::new(
            Arc::clone(&self.cloud),
            Arc::clone(&conns.talos),
            conns.workload.clone(),
        );
        self.pass(cluster, &mut conns, &observer, cancel).await
    }

    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn connect(&self, cluster: &TalosCluster) -> Result<Connections> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let talos_config = self
            .management
            .get_secret_data(&namespace, &cluster.talos_secret_name())
            .await?;
        let kubeconfig = self
            .management
            .get_secret_data(&namespace, &cluster.kubeconfig_secret_name())
            .await?
            .and_then(|mut data| data.remove(secrets::KUBECONFIG_KEY));

        let talosconfig = talos_config
            .as_ref()
            .and_then(|data| data.get(secrets::TALOSCONFIG_KEY).cloned());
        let talos = self.talos.connect(&namespace, &cluster.name_any(), talosconfig)?;

        let workload = match &kubeconfig {
            Some(kubeconfig) => match self.management.connect_workload(kubeconfig).await {
                Ok(api) => Some(api),
                Err(e) => {
                    warn!("Cannot connect to workload cluster: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Connections {
            talos,
            workload,
            talos_config,
            kubeconfig,
        })
    }

    /// One pass with explicit connections and observer
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn pass(
        &self,
        cluster: &TalosCluster,
        conns: &mut Connections,
        observer: &dyn NodeObserver,
        cancel: &CancellationToken,
    ) -> Result<TalosClusterStatus> {
        let now = Utc::now();
        let mut status = cluster.status.clone().unwrap_or_default();
        ensure_phase_open(&mut status, now);

        if let Err(e) = self.validate(cluster, &status) {
            warn!("Invalid cluster configuration: {}", e);
            record_error(&mut status, "config", e.to_string(), now);
            mark_phase_error(&mut status, &e.to_string());
            finish(cluster, &mut status, now);
            return Ok(status);
        }

        plan_nodes(cluster, &mut status, now);
        let observations = observe_nodes(&mut status, observer, now).await;

        let phase = status.provisioning_phase;
        if let Err(e) = self.ensure_infrastructure(cluster, &mut status, conns).await {
            record_failure(&mut status, "infrastructure", e, now)?;
        }
        if phase >= ProvisioningPhase::Image {
            if let Err(e) = self.ensure_image(cluster, &mut status).await {
                record_failure(&mut status, "image", e, now)?;
            }
        }
        if phase >= ProvisioningPhase::Compute {
            self.ensure_servers(cluster, &mut status, now).await;
        }
        if phase >= ProvisioningPhase::Bootstrap {
            self.bootstrap(cluster, &mut status, conns, &observations, now)
                .await?;
        }
        if phase >= ProvisioningPhase::Cni {
            self.install_addons(cluster, &mut status, conns, AddonScope::Cni, cancel, now)
                .await?;
        }
        if phase >= ProvisioningPhase::Addons {
            self.install_addons(cluster, &mut status, conns, AddonScope::Other, cancel, now)
                .await?;
        }
        self.delete_removed_servers(&mut status, now).await;

        update_ready_counts(
            &mut status,
            cluster.desired_count(NodeRole::ControlPlane),
            cluster.desired_count(NodeRole::Worker),
        );
        if self.phase_satisfied(cluster, &status, conns) {
            if let Some(next) = advance_phase(&mut status, now) {
                info!("Cluster advanced to {}", next);
            }
        }
        finish(cluster, &mut status, now);
        Ok(status)
    }

    /// Configuration errors stop the pass before anything is changed
    fn validate(&self, cluster: &TalosCluster, status: &TalosClusterStatus) -> Result<()> {
        if cluster.desired_count(NodeRole::ControlPlane) == 0 {
            return Err(TugboatError::ConfigError(
                "at least one control-plane node is required".to_string(),
            ));
        }
        let planned: HashSet<String> = cluster.planned_nodes().into_iter().map(|n| n.name).collect();
        if let Some(node) = status
            .control_planes
            .nodes
            .iter()
            .find(|n| !planned.contains(&n.name))
        {
            return Err(TugboatError::ConfigError(format!(
                "control plane {} is no longer in the spec; scaling down control planes is not supported",
                node.name
            )));
        }
        self.addons.validate(&cluster.spec)?;
        if self.hcloud_token.is_empty() {
            return Err(TugboatError::ConfigError("missing hcloud API token".to_string()));
        }
        Ok(())
    }

    async fn ensure_infrastructure(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
        conns: &mut Connections,
    ) -> Result<()> {
        let name = cluster.name_any();
        let resource_labels = cluster_labels(cluster);
        let infra = &mut status.infrastructure;

        if infra.placement_group_id.is_none() {
            infra.placement_group_id = Some(
                self.cloud
                    .ensure_placement_group(&name, &resource_labels)
                    .await?,
            );
        }
        let network_id = match infra.network_id {
            Some(id) => id,
            None => {
                let id = self
                    .cloud
                    .ensure_network(&NetworkRequest {
                        name: name.clone(),
                        ip_range: cluster.spec.network.ip_range.clone(),
                        subnet_range: cluster.spec.network.subnet_range.clone(),
                        network_zone: cluster.spec.network_zone.clone(),
                        labels: resource_labels.clone(),
                    })
                    .await?;
                infra.network_id = Some(id);
                id
            }
        };
        if infra.firewall_id.is_none() {
            infra.firewall_id = Some(self.cloud.ensure_firewall(&name, &resource_labels).await?);
        }
        if infra.load_balancer_id.is_none() || infra.load_balancer_ip.is_none() {
            let lb = self
                .cloud
                .ensure_load_balancer(&LoadBalancerRequest {
                    name: format!("{}-api", name),
                    location: cluster.spec.location.clone(),
                    network_id,
                    target_selector: cluster.control_plane_selector(),
                    labels: resource_labels,
                })
                .await?;
            infra.load_balancer_id = Some(lb.id);
            infra.load_balancer_ip = lb.public_ip;
        }

        if conns.talos_config.is_some() {
            return Ok(());
        }
        let Some(lb_ip) = infra.load_balancer_ip.clone() else {
            debug!("Load balancer has no address yet");
            return Ok(());
        };

        info!("Generating Talos machine configuration for {}", name);
        let generated = self
            .talos
            .generate_config(&ConfigRequest {
                cluster_name: name.clone(),
                endpoint: format!("https://{}:{}", lb_ip, crate::constants::ports::KUBE_API),
                talos_version: cluster.spec.talos_version.clone(),
                kubernetes_version: cluster.spec.kubernetes_version.clone(),
                installer_image: cluster.installer_image(),
                additional_sans: vec![lb_ip],
                pod_subnet: cluster.spec.network.pod_subnet.clone(),
            })
            .await?;

        let mut data = BTreeMap::new();
        data.insert(secrets::CONTROL_PLANE_KEY.to_string(), generated.control_plane);
        data.insert(secrets::WORKER_KEY.to_string(), generated.worker);
        data.insert(secrets::TALOSCONFIG_KEY.to_string(), generated.talosconfig);
        self.management
            .upsert_secret(
                &cluster.namespace().unwrap_or_else(|| "default".to_string()),
                &cluster.talos_secret_name(),
                data.clone(),
                cluster.controller_owner_ref(&()),
            )
            .await?;
        conns.talos_config = Some(data);
        Ok(())
    }

    async fn ensure_image(&self, cluster: &TalosCluster, status: &mut TalosClusterStatus) -> Result<()> {
        if status.infrastructure.image_id.is_some() {
            return Ok(());
        }
        let selector = format!(
            "{}=talos,{}={}",
            labels::IMAGE_OS,
            labels::IMAGE_TALOS_VERSION,
            cluster.spec.talos_version
        );
        match self.cloud.find_image_by_label(&selector).await? {
            Some(image) => {
                info!("Using Talos image {} ({})", image.id, image.description);
                status.infrastructure.image_id = Some(image.id);
                Ok(())
            }
            None => Err(TugboatError::ConfigError(format!(
                "no snapshot labelled {} found; build the Talos image first",
                selector
            ))),
        }
    }

    async fn ensure_servers(&self, cluster: &TalosCluster, status: &mut TalosClusterStatus, now: DateTime<Utc>) {
        let Some(image_id) = status.infrastructure.image_id else {
            return;
        };
        let planned: HashMap<String, PlannedNode> = cluster
            .planned_nodes()
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();
        let infra = status.infrastructure.clone();
        let mut errors = Vec::new();

        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            for node in status.group_mut(role).nodes.iter_mut() {
                if node.server_id.is_some() || node.phase.is_terminal() {
                    continue;
                }
                let Some(plan) = planned.get(&node.name) else {
                    continue;
                };
                if let Err(e) = self.ensure_server(cluster, node, plan, image_id, &infra).await {
                    errors.push(format!("{}: {}", node.name, e));
                }
            }
        }
        for error in errors {
            record_error(status, "compute", error, now);
        }
    }

    async fn ensure_server(
        &self,
        cluster: &TalosCluster,
        node: &mut NodeStatus,
        plan: &PlannedNode,
        image_id: i64,
        infra: &crate::types::cluster::InfrastructureStatus,
    ) -> Result<()> {
        // A server created by an earlier pass whose status write was lost
        let server = match self.cloud.get_server_by_name(&node.name).await? {
            Some(server) => server,
            None => {
                let mut server_labels = cluster_labels(cluster);
                server_labels.insert(labels::ROLE.to_string(), plan.role.as_label().to_string());
                server_labels.insert(labels::POOL.to_string(), plan.pool.clone());
                if let Some(pool) = cluster
                    .spec
                    .control_planes
                    .iter()
                    .chain(cluster.spec.workers.iter())
                    .find(|p| p.name == plan.pool)
                {
                    server_labels.extend(pool.labels.clone());
                }
                info!("Creating server {}", node.name);
                self.cloud
                    .create_server(&CreateServerRequest {
                        name: node.name.clone(),
                        server_type: plan.server_type.clone(),
                        image_id,
                        location: cluster.spec.location.clone(),
                        labels: server_labels,
                        network_id: infra.network_id,
                        firewall_id: infra.firewall_id,
                        placement_group_id: match plan.role {
                            NodeRole::ControlPlane => infra.placement_group_id,
                            NodeRole::Worker => None,
                        },
                    })
                    .await?
            }
        };
        node.server_id = Some(server.id);
        node.public_ip = server.public_ip.or(node.public_ip.take());
        node.private_ip = server.private_ip.or(node.private_ip.take());
        Ok(())
    }

    async fn bootstrap(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
        conns: &mut Connections,
        observations: &HashMap<String, Observation>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(talos_config) = conns.talos_config.clone() else {
            return Ok(());
        };

        // Machine configs for nodes waiting in maintenance mode
        let mut errors = Vec::new();
        for (role, node) in status.nodes() {
            let Some(observation) = observations.get(&node.name) else {
                continue;
            };
            let info = &observation.info;
            if !(info.talos_api_reachable && info.talos_in_maintenance_mode) {
                continue;
            }
            let (Some(ip), Some(config)) = (info.server_ip.as_deref(), talos_config.get(config_key(role))) else {
                continue;
            };
            info!("Applying {} configuration to {}", role, node.name);
            if let Err(e) = conns.talos.apply_config(ip, config).await {
                errors.push(format!("{}: {}", node.name, e));
            }
        }
        for error in errors {
            record_error(status, "talos", error, now);
        }

        let configured_cp = status.control_planes.nodes.iter().find_map(|node| {
            observations
                .get(&node.name)
                .filter(|o| o.info.talos_configured)
                .and_then(|o| o.info.server_ip.clone())
                .map(|ip| (node.name.clone(), ip))
        });
        let Some((cp_name, cp_ip)) = configured_cp else {
            return Ok(());
        };

        if !status.bootstrapped {
            info!("Bootstrapping etcd on {}", cp_name);
            match conns.talos.bootstrap(&cp_ip).await {
                Ok(()) => status.bootstrapped = true,
                Err(e) if e.to_string().contains("AlreadyExists") => status.bootstrapped = true,
                Err(e) => {
                    record_error(status, "bootstrap", format!("{}: {}", cp_name, e), now);
                    return Ok(());
                }
            }
        }

        if conns.kubeconfig.is_none() {
            match conns.talos.kubeconfig(&cp_ip).await {
                Ok(kubeconfig) => {
                    let mut data = BTreeMap::new();
                    data.insert(secrets::KUBECONFIG_KEY.to_string(), kubeconfig.clone());
                    self.management
                        .upsert_secret(
                            &cluster.namespace().unwrap_or_else(|| "default".to_string()),
                            &cluster.kubeconfig_secret_name(),
                            data,
                            cluster.controller_owner_ref(&()),
                        )
                        .await?;
                    info!("Stored kubeconfig of {}", cluster.name_any());
                    conns.kubeconfig = Some(kubeconfig);
                }
                Err(e) => record_error(status, "kubeconfig", e.to_string(), now),
            }
        }
        Ok(())
    }

    async fn install_addons(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
        conns: &Connections,
        scope: AddonScope,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pending = self
            .addons
            .enabled(&cluster.spec, scope)
            .into_iter()
            .any(|name| {
                !matches!(
                    status.addons.get(name).map(|s| s.phase),
                    Some(AddonPhase::Installed | AddonPhase::Failed)
                )
            });
        if !pending {
            return Ok(());
        }
        let Some(workload) = &conns.workload else {
            debug!("Workload cluster not reachable yet, addons wait");
            return Ok(());
        };

        let ctx = AddonContext {
            cluster,
            hcloud_token: &self.hcloud_token,
            renderer: self.renderer.as_ref(),
        };
        let transitions = self
            .addons
            .install(&ctx, workload.as_ref(), scope, &mut status.addons, now, cancel)
            .await?;
        for (addon, phase) in transitions {
            if phase == AddonPhase::Failed {
                let message = status
                    .addons
                    .get(&addon)
                    .and_then(|s| s.message.clone())
                    .unwrap_or_default();
                record_error(status, &format!("addon/{}", addon), message, now);
            }
        }
        Ok(())
    }

    /// Delete servers of scaled-down nodes; drop the entry once the server is gone
    async fn delete_removed_servers(&self, status: &mut TalosClusterStatus, now: DateTime<Utc>) {
        let deleting: Vec<String> = status
            .nodes()
            .filter(|(_, n)| n.phase == NodePhase::DeletingServer)
            .map(|(_, n)| n.name.clone())
            .collect();

        for name in deleting {
            let result = match self.cloud.get_server_by_name(&name).await {
                Ok(Some(server)) => self.cloud.delete_server(server.id).await.map(|_| false),
                Ok(None) => Ok(true),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => {
                    info!("Server of {} is gone, removing node", name);
                    for role in [NodeRole::ControlPlane, NodeRole::Worker] {
                        status.group_mut(role).nodes.retain(|n| n.name != name);
                    }
                }
                Ok(false) => {}
                Err(e) => record_error(status, "compute", format!("{}: {}", name, e), now),
            }
        }
    }

    fn phase_satisfied(&self, cluster: &TalosCluster, status: &TalosClusterStatus, conns: &Connections) -> bool {
        let active = || status.nodes().filter(|(_, n)| n.phase != NodePhase::DeletingServer);
        let control_planes = || status.control_planes.nodes.iter();
        let addons_installed = |scope| {
            self.addons
                .enabled(&cluster.spec, scope)
                .into_iter()
                .all(|name| status.addons.get(name).map(|s| s.phase) == Some(AddonPhase::Installed))
        };

        match status.provisioning_phase {
            ProvisioningPhase::Infrastructure => {
                status.infrastructure.is_complete() && conns.talos_config.is_some()
            }
            ProvisioningPhase::Image => status.infrastructure.image_id.is_some(),
            ProvisioningPhase::Compute => {
                active().count() == cluster.planned_nodes().len()
                    && active().all(|(_, n)| {
                        n.server_id.is_some()
                            && n.phase != NodePhase::Failed
                            && n.phase.rank() > NodePhase::WaitingForIP.rank()
                    })
            }
            ProvisioningPhase::Bootstrap => {
                status.bootstrapped
                    && conns.kubeconfig.is_some()
                    && control_planes().all(|n| n.phase.has_joined())
            }
            ProvisioningPhase::Cni => {
                addons_installed(AddonScope::Cni)
                    && control_planes().all(|n| n.phase == NodePhase::Ready)
            }
            ProvisioningPhase::Addons => {
                addons_installed(AddonScope::Other)
                    && active().all(|(_, n)| n.phase == NodePhase::Ready)
            }
            ProvisioningPhase::Complete => false,
        }
    }
}

fn config_key(role: NodeRole) -> &'static str {
    match role {
        NodeRole::ControlPlane => secrets::CONTROL_PLANE_KEY,
        NodeRole::Worker => secrets::WORKER_KEY,
    }
}

fn cluster_labels(cluster: &TalosCluster) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(labels::CLUSTER.to_string(), cluster.name_any());
    map
}

/// Cancellation aborts the pass; anything else is recorded and the pass goes on
fn record_failure(
    status: &mut TalosClusterStatus,
    component: &str,
    error: TugboatError,
    now: DateTime<Utc>,
) -> Result<()> {
    if matches!(error, TugboatError::Cancelled) {
        return Err(error);
    }
    warn!("{} step failed: {}", component, error);
    record_error(status, component, error.to_string(), now);
    Ok(())
}

fn finish(cluster: &TalosCluster, status: &mut TalosClusterStatus, now: DateTime<Utc>) {
    status.phase = derive_cluster_phase(status);
    status.observed_generation = cluster.meta().generation;
    status.last_reconcile_time = Some(now);
}

/// Add status entries for newly planned nodes and mark workers that are no
/// longer planned for deletion.
pub fn plan_nodes(cluster: &TalosCluster, status: &mut TalosClusterStatus, now: DateTime<Utc>) {
    let planned = cluster.planned_nodes();
    let planned_names: HashSet<&str> = planned.iter().map(|n| n.name.as_str()).collect();

    for plan in &planned {
        if status.find_node(&plan.name).is_none() {
            debug!("Planning node {}", plan.name);
            status.group_mut(plan.role).nodes.push(NodeStatus {
                name: plan.name.clone(),
                pool: plan.pool.clone(),
                phase: NodePhase::CreatingServer,
                reason: Some("planned".to_string()),
                phase_transition_time: Some(now),
                ..Default::default()
            });
        }
    }

    for node in status.workers.nodes.iter_mut() {
        if !planned_names.contains(node.name.as_str()) && node.phase != NodePhase::DeletingServer {
            info!("Worker {} is no longer planned", node.name);
            apply_node_phase(node, NodePhase::DeletingServer, "scaled down".to_string(), now);
        }
    }
}

/// Observe and resolve every node that has a server and is not in a terminal
/// phase. Observations run concurrently; the status is written afterwards.
pub async fn observe_nodes(
    status: &mut TalosClusterStatus,
    observer: &dyn NodeObserver,
    now: DateTime<Utc>,
) -> HashMap<String, Observation> {
    let targets: Vec<NodeStatus> = status
        .nodes()
        .map(|(_, n)| n)
        .filter(|n| !n.phase.is_terminal() && n.server_id.is_some())
        .cloned()
        .collect();

    let results = join_all(targets.iter().map(|node| async move {
        (node.name.clone(), observer.observe(node).await)
    }))
    .await;

    let mut observations = HashMap::new();
    for (name, result) in results {
        match result {
            Ok(observation) => {
                let (phase, reason) = resolve(&observation.info);
                if let Some(node) = status.find_node_mut(&name) {
                    if apply_node_phase(node, phase, reason, now) {
                        info!(node = %name, "Node is now {}", phase);
                    }
                    if observation.info.server_exists {
                        node.server_id = observation.server_id.or(node.server_id);
                        node.public_ip = observation.public_ip.clone();
                        node.private_ip = observation.private_ip.clone();
                    }
                }
                observations.insert(name, observation);
            }
            Err(e) => {
                warn!(node = %name, "Observation failed: {}", e);
                record_error(status, "observer", format!("{}: {}", name, e), now);
            }
        }
    }
    observations
}
