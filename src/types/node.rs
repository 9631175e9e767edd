// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Node lifecycle phases and the per-pass observation snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a single node, derived every pass from observations.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, schemars::JsonSchema)]
pub enum NodePhase {
    #[default]
    CreatingServer,
    WaitingForIP,
    WaitingForTalosAPI,
    ApplyingTalosConfig,
    RebootingWithConfig,
    WaitingForK8s,
    NodeInitializing,
    Ready,
    Failed,
    DeletingServer,
}

impl NodePhase {
    /// Failed and DeletingServer are never re-evaluated once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodePhase::Failed | NodePhase::DeletingServer)
    }

    /// Forward position along the provisioning path.
    pub fn rank(self) -> u8 {
        match self {
            NodePhase::CreatingServer => 0,
            NodePhase::WaitingForIP => 1,
            NodePhase::WaitingForTalosAPI => 2,
            NodePhase::ApplyingTalosConfig => 3,
            NodePhase::RebootingWithConfig => 4,
            NodePhase::WaitingForK8s => 5,
            NodePhase::NodeInitializing => 6,
            NodePhase::Ready => 7,
            NodePhase::Failed | NodePhase::DeletingServer => u8::MAX,
        }
    }

    /// A Kubernetes node object exists or the kubelet is about to register one.
    pub fn has_joined(self) -> bool {
        matches!(
            self,
            NodePhase::WaitingForK8s | NodePhase::NodeInitializing | NodePhase::Ready
        )
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, schemars::JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_label(self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Server status as reported by the cloud provider
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Running,
    Starting,
    Initializing,
    Off,
    Stopping,
    Deleting,
    Rebuilding,
    Migrating,
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Running => "running",
            ServerState::Starting => "starting",
            ServerState::Initializing => "initializing",
            ServerState::Off => "off",
            ServerState::Stopping => "stopping",
            ServerState::Deleting => "deleting",
            ServerState::Rebuilding => "rebuilding",
            ServerState::Migrating => "migrating",
            ServerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Everything known about one node for the current pass. Never persisted.
///
/// Each field may be stale or unavailable; an unreachable API leaves its
/// fields at `false`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStateInfo {
    pub server_exists: bool,
    pub server_status: ServerState,
    pub server_ip: Option<String>,
    pub talos_api_reachable: bool,
    pub talos_in_maintenance_mode: bool,
    pub talos_configured: bool,
    pub talos_kubelet_running: bool,
    pub k8s_node_exists: bool,
    pub k8s_node_ready: bool,
}
