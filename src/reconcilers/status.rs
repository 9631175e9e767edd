// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Pure status transitions of a TalosCluster.

use crate::constants::reconcile::MAX_LAST_ERRORS;
use crate::types::{
    AddonPhase, ClusterPhase, ErrorRecord, NodePhase, NodeRole, NodeStatus, PhaseRecord,
    ProvisioningPhase, TalosClusterStatus,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Append to the error ring, dropping the oldest entries beyond the bound.
/// An error identical to the newest entry is not repeated.
pub fn record_error(
    status: &mut TalosClusterStatus,
    component: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    let phase = status.provisioning_phase;
    let repeated = status
        .last_errors
        .last()
        .is_some_and(|e| e.phase == phase && e.component == component && e.message == message);
    if repeated {
        return;
    }
    status.last_errors.push(ErrorRecord {
        time: now,
        phase,
        component: component.to_string(),
        message,
    });
    let excess = status.last_errors.len().saturating_sub(MAX_LAST_ERRORS);
    status.last_errors.drain(..excess);
}

/// Make sure the history has an open record for the current phase
pub fn ensure_phase_open(status: &mut TalosClusterStatus, now: DateTime<Utc>) {
    let phase = status.provisioning_phase;
    if phase == ProvisioningPhase::Complete {
        return;
    }
    let open = status
        .phase_history
        .last()
        .is_some_and(|r| r.phase == phase && r.ended_at.is_none());
    if !open {
        status.phase_history.push(PhaseRecord {
            phase,
            started_at: now,
            ended_at: None,
            duration_seconds: None,
            error: None,
        });
    }
}

/// Close the current phase record and move to the next phase
pub fn advance_phase(status: &mut TalosClusterStatus, now: DateTime<Utc>) -> Option<ProvisioningPhase> {
    let current = status.provisioning_phase;
    let next = current.next()?;
    if let Some(record) = status
        .phase_history
        .iter_mut()
        .rev()
        .find(|r| r.phase == current && r.ended_at.is_none())
    {
        record.ended_at = Some(now);
        record.duration_seconds = Some((now - record.started_at).num_seconds());
    }
    status.provisioning_phase = next;
    ensure_phase_open(status, now);
    Some(next)
}

/// Attach an error to the open record of the current phase
pub fn mark_phase_error(status: &mut TalosClusterStatus, message: &str) {
    let phase = status.provisioning_phase;
    if let Some(record) = status
        .phase_history
        .iter_mut()
        .rev()
        .find(|r| r.phase == phase && r.ended_at.is_none())
    {
        record.error = Some(message.to_string());
    }
}

/// Record a resolved phase. Returns true if the phase changed; the transition
/// time only moves on a change.
pub fn apply_node_phase(
    node: &mut NodeStatus,
    phase: NodePhase,
    reason: String,
    now: DateTime<Utc>,
) -> bool {
    node.reason = Some(reason);
    if node.phase == phase {
        return false;
    }
    if phase != NodePhase::Failed && phase.rank() < node.phase.rank() {
        warn!(
            node = %node.name,
            "Node phase regressed from {} to {}", node.phase, phase
        );
    }
    node.phase = phase;
    node.phase_transition_time = Some(now);
    true
}

pub fn update_ready_counts(status: &mut TalosClusterStatus, desired_cp: u32, desired_workers: u32) {
    for (role, desired) in [
        (NodeRole::ControlPlane, desired_cp),
        (NodeRole::Worker, desired_workers),
    ] {
        let group = status.group_mut(role);
        group.desired = desired;
        group.ready = group
            .nodes
            .iter()
            .filter(|n| n.phase == NodePhase::Ready)
            .count() as u32;
    }
}

pub fn derive_cluster_phase(status: &TalosClusterStatus) -> ClusterPhase {
    let node_failed = status.nodes().any(|(_, n)| n.phase == NodePhase::Failed);
    let addon_failed = status.addons.values().any(|a| a.phase == AddonPhase::Failed);
    if node_failed || addon_failed {
        ClusterPhase::Failed
    } else if status.provisioning_phase == ProvisioningPhase::Complete {
        ClusterPhase::Running
    } else {
        ClusterPhase::Provisioning
    }
}

fn default_duration(phase: ProvisioningPhase) -> Duration {
    Duration::from_secs(match phase {
        ProvisioningPhase::Infrastructure => 60,
        ProvisioningPhase::Image => 10,
        ProvisioningPhase::Compute => 120,
        ProvisioningPhase::Bootstrap => 300,
        ProvisioningPhase::Cni => 120,
        ProvisioningPhase::Addons => 300,
        ProvisioningPhase::Complete => 0,
    })
}

/// Average duration of completed attempts of a phase, if there are any
fn historical_duration(status: &TalosClusterStatus, phase: ProvisioningPhase) -> Option<Duration> {
    let durations: Vec<i64> = status
        .phase_history
        .iter()
        .filter(|r| r.phase == phase && r.error.is_none())
        .filter_map(|r| r.duration_seconds)
        .collect();
    if durations.is_empty() {
        return None;
    }
    let avg = durations.iter().sum::<i64>() / durations.len() as i64;
    Some(Duration::from_secs(avg.max(0) as u64))
}

/// Estimated time until Complete: the rest of the current phase plus every
/// phase after it
pub fn estimate_remaining(status: &TalosClusterStatus, now: DateTime<Utc>) -> Duration {
    let current = status.provisioning_phase;
    let expected = |phase| historical_duration(status, phase).unwrap_or_else(|| default_duration(phase));

    let elapsed = status
        .phase_history
        .last()
        .filter(|r| r.phase == current && r.ended_at.is_none())
        .map(|r| (now - r.started_at).to_std().unwrap_or_default())
        .unwrap_or_default();

    let rest_of_current = expected(current).saturating_sub(elapsed);
    ProvisioningPhase::ALL
        .iter()
        .filter(|p| **p > current)
        .map(|p| expected(*p))
        .fold(rest_of_current, |acc, d| acc + d)
}
