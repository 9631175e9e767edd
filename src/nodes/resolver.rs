// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Maps an observation snapshot to a node phase.
//!
//! The checks run in a fixed order and the first match wins. Kubernetes
//! signals outrank Talos signals, which outrank the cloud server state, so a
//! node that is visibly serving in the cluster is never pulled back by a
//! lagging lower-level API. Every branch is total: missing data lands on an
//! earlier phase instead of an error.

use crate::types::{NodePhase, NodeStateInfo, ServerState};

/// Derive the phase of a node and a human readable reason for it.
pub fn resolve(info: &NodeStateInfo) -> (NodePhase, String) {
    if !info.server_exists {
        return (
            NodePhase::Failed,
            "no server found via cloud provider".to_string(),
        );
    }

    if info.k8s_node_exists {
        return if info.k8s_node_ready {
            (NodePhase::Ready, "node is registered and ready".to_string())
        } else if info.talos_kubelet_running {
            (
                NodePhase::NodeInitializing,
                "node registered, kubelet running, waiting for ready condition".to_string(),
            )
        } else {
            (
                NodePhase::WaitingForK8s,
                "node registered, waiting for kubelet".to_string(),
            )
        };
    }

    if info.talos_configured {
        return if info.talos_kubelet_running {
            (
                NodePhase::WaitingForK8s,
                "kubelet running, waiting for node registration".to_string(),
            )
        } else {
            (
                NodePhase::RebootingWithConfig,
                "configuration applied, waiting for reboot".to_string(),
            )
        };
    }

    if info.talos_api_reachable {
        return if info.talos_in_maintenance_mode {
            (
                NodePhase::WaitingForTalosAPI,
                "Talos API reachable in maintenance mode, waiting for configuration".to_string(),
            )
        } else {
            (
                NodePhase::ApplyingTalosConfig,
                "Talos API reachable, applying configuration".to_string(),
            )
        };
    }

    match info.server_status {
        ServerState::Running => {
            let reason = match &info.server_ip {
                Some(ip) => format!("server running at {}, waiting for Talos API", ip),
                None => "server running, waiting for Talos API".to_string(),
            };
            (NodePhase::WaitingForTalosAPI, reason)
        }
        ServerState::Starting => (
            NodePhase::WaitingForIP,
            "server starting, waiting for IP".to_string(),
        ),
        other => (
            NodePhase::CreatingServer,
            format!("server is {}", other),
        ),
    }
}
