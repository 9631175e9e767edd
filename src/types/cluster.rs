// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{labels, secrets, DEFAULT_POD_SUBNET};
use crate::types::node::{NodePhase, NodeRole};
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(group = "tugboat.geeko.me", version = "v1alpha1", kind = "TalosCluster")]
#[kube(namespaced)]
#[kube(status = "TalosClusterStatus")]
#[kube(shortname = "tc")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.provisioningPhase"}"#)]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterSpec {
    /// Hetzner location, e.g. `fsn1`
    pub location: String,
    #[serde(default = "default_network_zone")]
    pub network_zone: String,
    pub control_planes: Vec<NodePoolSpec>,
    #[serde(default)]
    pub workers: Vec<NodePoolSpec>,
    pub talos_version: String,
    pub kubernetes_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_image: Option<String>,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub addons: AddonsSpec,
}

fn default_network_zone() -> String {
    "eu-central".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub name: String,
    pub server_type: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub ip_range: String,
    pub subnet_range: String,
    /// Pod CIDR inside the cluster, separate from the private network
    #[serde(default = "default_pod_subnet")]
    pub pod_subnet: String,
}

fn default_pod_subnet() -> String {
    DEFAULT_POD_SUBNET.to_string()
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            ip_range: "10.0.0.0/16".to_string(),
            subnet_range: "10.0.1.0/24".to_string(),
            pod_subnet: default_pod_subnet(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonToggle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Chart version override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonsSpec {
    #[serde(default)]
    pub cilium: AddonToggle,
    #[serde(default)]
    pub hcloud_ccm: AddonToggle,
    #[serde(default)]
    pub hcloud_csi: AddonToggle,
    #[serde(default)]
    pub metrics_server: AddonToggle,
    #[serde(default)]
    pub cert_manager: AddonToggle,
    #[serde(default)]
    pub ingress_nginx: AddonToggle,
}

impl AddonsSpec {
    /// Look up the toggle for a built-in addon by its name
    pub fn toggle(&self, addon: &str) -> Option<&AddonToggle> {
        match addon {
            "cilium" => Some(&self.cilium),
            "hcloud-ccm" => Some(&self.hcloud_ccm),
            "hcloud-csi" => Some(&self.hcloud_csi),
            "metrics-server" => Some(&self.metrics_server),
            "cert-manager" => Some(&self.cert_manager),
            "ingress-nginx" => Some(&self.ingress_nginx),
            _ => None,
        }
    }
}

/// A node the spec asks for, before anything exists in the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedNode {
    pub name: String,
    pub pool: String,
    pub role: NodeRole,
    pub server_type: String,
}

impl TalosCluster {
    /// All nodes the spec asks for, named `<cluster>-<pool>-<index>`
    pub fn planned_nodes(&self) -> Vec<PlannedNode> {
        let cluster = self.name_any();
        let pools = self
            .spec
            .control_planes
            .iter()
            .map(|p| (p, NodeRole::ControlPlane))
            .chain(self.spec.workers.iter().map(|p| (p, NodeRole::Worker)));

        pools
            .flat_map(|(pool, role)| {
                let cluster = cluster.clone();
                (1..=pool.count).map(move |i| PlannedNode {
                    name: format!("{}-{}-{}", cluster, pool.name, i),
                    pool: pool.name.clone(),
                    role,
                    server_type: pool.server_type.clone(),
                })
            })
            .collect()
    }

    pub fn desired_count(&self, role: NodeRole) -> u32 {
        let pools = match role {
            NodeRole::ControlPlane => &self.spec.control_planes,
            NodeRole::Worker => &self.spec.workers,
        };
        pools.iter().map(|p| p.count).sum()
    }

    pub fn talos_secret_name(&self) -> String {
        format!("{}{}", self.name_any(), secrets::TALOS_SUFFIX)
    }

    pub fn kubeconfig_secret_name(&self) -> String {
        format!("{}{}", self.name_any(), secrets::KUBECONFIG_SUFFIX)
    }

    /// Installer image used for installs and upgrades
    pub fn installer_image(&self) -> String {
        self.spec
            .installer_image
            .clone()
            .unwrap_or_else(|| installer_image_for(&self.spec.talos_version))
    }

    /// Label selector matching every server of this cluster
    pub fn server_selector(&self) -> String {
        format!("{}={}", labels::CLUSTER, self.name_any())
    }

    /// Label selector matching the control planes behind the load balancer
    pub fn control_plane_selector(&self) -> String {
        format!(
            "{}={},{}={}",
            labels::CLUSTER,
            self.name_any(),
            labels::ROLE,
            NodeRole::ControlPlane.as_label()
        )
    }
}

pub fn installer_image_for(talos_version: &str) -> String {
    format!("ghcr.io/siderolabs/installer:{}", talos_version)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Provisioning,
    Running,
    Failed,
}

/// Cluster-wide macro-phase. Ordered; advances one step at a time.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, schemars::JsonSchema,
)]
pub enum ProvisioningPhase {
    #[default]
    Infrastructure,
    Image,
    Compute,
    Bootstrap,
    #[serde(rename = "CNI")]
    Cni,
    Addons,
    Complete,
}

impl ProvisioningPhase {
    pub const ALL: [ProvisioningPhase; 7] = [
        ProvisioningPhase::Infrastructure,
        ProvisioningPhase::Image,
        ProvisioningPhase::Compute,
        ProvisioningPhase::Bootstrap,
        ProvisioningPhase::Cni,
        ProvisioningPhase::Addons,
        ProvisioningPhase::Complete,
    ];

    pub fn next(self) -> Option<ProvisioningPhase> {
        let idx = Self::ALL.iter().position(|p| *p == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningPhase::Cni => f.write_str("CNI"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default)]
    pub provisioning_phase: ProvisioningPhase,
    #[serde(default)]
    pub infrastructure: InfrastructureStatus,
    /// etcd bootstrap has been issued; never issued twice
    #[serde(default)]
    pub bootstrapped: bool,
    #[serde(default)]
    pub control_planes: NodeGroupStatus,
    #[serde(default)]
    pub workers: NodeGroupStatus,
    #[serde(default)]
    pub addons: BTreeMap<String, AddonStatus>,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
    #[serde(default)]
    pub last_errors: Vec<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl TalosClusterStatus {
    pub fn group(&self, role: NodeRole) -> &NodeGroupStatus {
        match role {
            NodeRole::ControlPlane => &self.control_planes,
            NodeRole::Worker => &self.workers,
        }
    }

    pub fn group_mut(&mut self, role: NodeRole) -> &mut NodeGroupStatus {
        match role {
            NodeRole::ControlPlane => &mut self.control_planes,
            NodeRole::Worker => &mut self.workers,
        }
    }

    /// All nodes, control planes first
    pub fn nodes(&self) -> impl Iterator<Item = (NodeRole, &NodeStatus)> {
        self.control_planes
            .nodes
            .iter()
            .map(|n| (NodeRole::ControlPlane, n))
            .chain(self.workers.nodes.iter().map(|n| (NodeRole::Worker, n)))
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes().map(|(_, n)| n).find(|n| n.name == name)
    }

    pub fn find_node_mut(&mut self, name: &str) -> Option<&mut NodeStatus> {
        self.control_planes
            .nodes
            .iter_mut()
            .chain(self.workers.nodes.iter_mut())
            .find(|n| n.name == name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<i64>,
}

impl InfrastructureStatus {
    pub fn is_complete(&self) -> bool {
        self.network_id.is_some()
            && self.firewall_id.is_some()
            && self.load_balancer_id.is_some()
            && self.load_balancer_ip.is_some()
            && self.placement_group_id.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    pub desired: u32,
    pub ready: u32,
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub pool: String,
    pub phase: NodePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_transition_time: Option<DateTime<Utc>>,
}

impl NodeStatus {
    /// Best address to reach the node on, public first
    pub fn address(&self) -> Option<&str> {
        self.public_ip.as_deref().or(self.private_ip.as_deref())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum AddonPhase {
    #[default]
    NotInstalled,
    Installing,
    Installed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    pub installed: bool,
    pub healthy: bool,
    pub phase: AddonPhase,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: ProvisioningPhase,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub phase: ProvisioningPhase,
    pub component: String,
    pub message: String,
}
