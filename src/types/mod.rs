// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! TalosCluster custom resource and node lifecycle types.

pub mod cluster;
pub mod node;

pub use cluster::{
    AddonPhase, AddonStatus, ClusterPhase, ErrorRecord, NodeStatus, PhaseRecord, ProvisioningPhase,
    TalosCluster, TalosClusterSpec, TalosClusterStatus,
};
pub use node::{NodePhase, NodeRole, NodeStateInfo, ServerState};
