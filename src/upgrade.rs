// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Rolling Talos and Kubernetes upgrades.
//!
//! Control planes go one at a time, and each must come back ready and pass a
//! cluster health check before the next one is touched, so etcd never loses
//! two members at once. Workers follow one at a time. Kubernetes goes last,
//! once, through a single reachable control plane.

use crate::constants::upgrade::{
    HEALTH_CHECK_DELAY, HEALTH_CHECK_RETRIES, READY_POLL_INTERVAL, READY_TIMEOUT,
};
use crate::error::{Result, TugboatError};
use crate::providers::talos::{TalosApi, UpgradeRequest};
use crate::retry::{cancellable, sleep_or_cancel};
use crate::types::cluster::installer_image_for;
use crate::types::{NodeRole, TalosClusterStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Clone, Debug, Default)]
pub struct UpgradeOptions {
    pub talos_version: Option<String>,
    /// Defaults to the stock installer of `talos_version`
    pub installer_image: Option<String>,
    pub kubernetes_version: Option<String>,
    pub dry_run: bool,
    pub skip_health_check: bool,
    pub stage: bool,
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeNode {
    pub name: String,
    pub address: String,
    pub role: NodeRole,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub plan: Vec<String>,
    pub upgraded: Vec<String>,
    pub skipped: Vec<String>,
    pub kubernetes_upgraded: bool,
}

/// Upgradeable nodes of a cluster, from its recorded status
pub fn nodes_from_status(status: &TalosClusterStatus) -> Vec<UpgradeNode> {
    status
        .nodes()
        .filter(|(_, node)| !node.phase.is_terminal())
        .filter_map(|(role, node)| {
            node.address().map(|address| UpgradeNode {
                name: node.name.clone(),
                address: address.to_string(),
                role,
            })
        })
        .collect()
}

fn same_version(a: &str, b: &str) -> bool {
    a.trim_start_matches('v') == b.trim_start_matches('v')
}

pub struct UpgradeOrchestrator {
    talos: Arc<dyn TalosApi>,
    ready_timeout: Duration,
    ready_poll_interval: Duration,
    health_check_retries: u32,
    health_check_delay: Duration,
}

impl UpgradeOrchestrator {
    pub fn new(talos: Arc<dyn TalosApi>) -> Self {
        Self {
            talos,
            ready_timeout: READY_TIMEOUT,
            ready_poll_interval: READY_POLL_INTERVAL,
            health_check_retries: HEALTH_CHECK_RETRIES,
            health_check_delay: HEALTH_CHECK_DELAY,
        }
    }

    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub async fn run(
        &self,
        nodes: &[UpgradeNode],
        options: &UpgradeOptions,
        cancel: &CancellationToken,
    ) -> Result<UpgradeReport> {
        if options.talos_version.is_none() && options.kubernetes_version.is_none() {
            return Err(TugboatError::ConfigError(
                "no target Talos or Kubernetes version given".to_string(),
            ));
        }
        let control_planes: Vec<&UpgradeNode> = nodes
            .iter()
            .filter(|n| n.role == NodeRole::ControlPlane)
            .collect();
        let workers: Vec<&UpgradeNode> =
            nodes.iter().filter(|n| n.role == NodeRole::Worker).collect();
        if control_planes.is_empty() {
            return Err(TugboatError::ConfigError(
                "cluster has no reachable control-plane nodes".to_string(),
            ));
        }

        let mut report = UpgradeReport::default();

        if let Some(target) = &options.talos_version {
            let image = options
                .installer_image
                .clone()
                .unwrap_or_else(|| installer_image_for(target));
            let request = UpgradeRequest {
                image,
                stage: options.stage,
                force: options.force,
            };

            for node in &control_planes {
                self.upgrade_node(node, target, &request, options, &mut report, cancel)
                    .await?;
            }
            for node in &workers {
                self.upgrade_node(node, target, &request, options, &mut report, cancel)
                    .await?;
            }
        }

        if let Some(version) = &options.kubernetes_version {
            self.upgrade_kubernetes(&control_planes, version, options.dry_run, &mut report, cancel)
                .await?;
        }

        Ok(report)
    }

    async fn upgrade_node(
        &self,
        node: &UpgradeNode,
        target: &str,
        request: &UpgradeRequest,
        options: &UpgradeOptions,
        report: &mut UpgradeReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = cancellable(self.talos.version(&node.address), cancel)
            .await
            .map_err(|e| aborted(e, |e| format!("cannot read version of {}: {}", node.name, e)))?;

        if same_version(&current, target) {
            report
                .plan
                .push(format!("skip {} ({}): already at {}", node.name, node.role, current));
            report.skipped.push(node.name.clone());
            return Ok(());
        }

        report.plan.push(format!(
            "upgrade {} ({}): {} -> {}",
            node.name, node.role, current, target
        ));
        if options.dry_run {
            return Ok(());
        }

        info!("Upgrading {} from {} to {}", node.name, current, target);
        cancellable(self.talos.upgrade(&node.address, request), cancel)
            .await
            .map_err(|e| aborted(e, |e| format!("upgrade of {} failed: {}", node.name, e)))?;

        wait_for_node_ready(
            self.talos.as_ref(),
            &node.address,
            self.ready_timeout,
            self.ready_poll_interval,
            cancel,
        )
        .await
        .map_err(|e| aborted(e, |e| format!("{} did not become ready: {}", node.name, e)))?;

        if node.role == NodeRole::ControlPlane && !options.skip_health_check {
            health_check_with_retry(
                self.talos.as_ref(),
                &node.address,
                self.health_check_retries,
                self.health_check_delay,
                cancel,
            )
            .await?;
        }

        report.upgraded.push(node.name.clone());
        Ok(())
    }

    async fn upgrade_kubernetes(
        &self,
        control_planes: &[&UpgradeNode],
        version: &str,
        dry_run: bool,
        report: &mut UpgradeReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut endpoint = None;
        for node in control_planes {
            match cancellable(self.talos.version(&node.address), cancel).await {
                Ok(_) => {
                    endpoint = Some(*node);
                    break;
                }
                Err(TugboatError::Cancelled) => return Err(TugboatError::Cancelled),
                Err(e) => warn!("Control plane {} not reachable: {}", node.name, e),
            }
        }
        let Some(node) = endpoint else {
            return Err(TugboatError::UpgradeAborted(
                "no reachable control plane for the Kubernetes upgrade".to_string(),
            ));
        };

        report
            .plan
            .push(format!("upgrade Kubernetes to {} via {}", version, node.name));
        if dry_run {
            return Ok(());
        }

        info!("Upgrading Kubernetes to {} via {}", version, node.name);
        cancellable(self.talos.upgrade_kubernetes(&node.address, version), cancel)
            .await
            .map_err(|e| aborted(e, |e| format!("Kubernetes upgrade failed: {}", e)))?;
        report.kubernetes_upgraded = true;
        Ok(())
    }
}

/// Wrap a failure as an aborted upgrade; cancellation passes through as is
fn aborted(error: TugboatError, context: impl FnOnce(&TugboatError) -> String) -> TugboatError {
    match error {
        TugboatError::Cancelled => error,
        other => TugboatError::UpgradeAborted(context(&other)),
    }
}

/// Poll until the node reports ready. Errors count as "not yet": the node is
/// usually rebooting.
pub async fn wait_for_node_ready(
    talos: &dyn TalosApi,
    node: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let ready = tokio::select! {
            _ = cancel.cancelled() => return Err(TugboatError::Cancelled),
            r = talos.node_ready(node) => r,
        };
        if matches!(ready, Ok(true)) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TugboatError::Timeout(format!(
                "node {} not ready after {}s",
                node,
                timeout.as_secs()
            )));
        }
        sleep_or_cancel(poll_interval, cancel).await?;
    }
}

/// Run the cluster health check up to `retries` times with a fixed delay.
/// Returns the number of checks performed. Cancellation is honoured during
/// every check and every delay.
pub async fn health_check_with_retry(
    talos: &dyn TalosApi,
    endpoint: &str,
    retries: u32,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<u32> {
    let retries = retries.max(1);
    let mut last_error = None;

    for attempt in 1..=retries {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TugboatError::Cancelled),
            r = talos.health_check(endpoint) => r,
        };
        match result {
            Ok(()) => {
                info!("Health check via {} passed on attempt {}", endpoint, attempt);
                return Ok(attempt);
            }
            Err(e) => {
                warn!("Health check via {} failed (attempt {}/{}): {}", endpoint, attempt, retries, e);
                last_error = Some(e);
            }
        }
        if attempt < retries {
            sleep_or_cancel(delay, cancel).await?;
        }
    }

    Err(TugboatError::UpgradeAborted(format!(
        "cluster unhealthy after {} health checks via {}: {}",
        retries,
        endpoint,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::talos::MockTalosApi;
    use mockall::Sequence;

    fn node(name: &str, address: &str, role: NodeRole) -> UpgradeNode {
        UpgradeNode {
            name: name.to_string(),
            address: address.to_string(),
            role,
        }
    }

    fn options(version: &str) -> UpgradeOptions {
        UpgradeOptions {
            talos_version: Some(version.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_outdated_control_plane_is_upgraded() {
        let mut talos = MockTalosApi::new();
        talos.expect_version().returning(|addr| {
            Ok(match addr {
                "10.0.1.1" => "v1.9.0".to_string(),
                _ => "v1.8.3".to_string(),
            })
        });
        talos
            .expect_upgrade()
            .withf(|addr, req| addr == "10.0.1.2" && req.image == "ghcr.io/siderolabs/installer:v1.9.0")
            .times(1)
            .returning(|_, _| Ok(()));
        talos.expect_node_ready().returning(|_| Ok(true));
        talos.expect_health_check().times(1).returning(|_| Ok(()));

        let orchestrator = UpgradeOrchestrator::new(Arc::new(talos));
        let nodes = vec![
            node("prod-cp-1", "10.0.1.1", NodeRole::ControlPlane),
            node("prod-cp-2", "10.0.1.2", NodeRole::ControlPlane),
        ];
        let report = orchestrator
            .run(&nodes, &options("v1.9.0"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.upgraded, vec!["prod-cp-2"]);
        assert_eq!(report.skipped, vec!["prod-cp-1"]);
    }

    #[tokio::test]
    async fn test_dry_run_never_upgrades() {
        let mut talos = MockTalosApi::new();
        talos.expect_version().returning(|_| Ok("v1.7.0".to_string()));
        talos.expect_upgrade().never();
        talos.expect_upgrade_kubernetes().never();
        talos.expect_health_check().never();

        let orchestrator = UpgradeOrchestrator::new(Arc::new(talos));
        let nodes = vec![
            node("prod-cp-1", "10.0.1.1", NodeRole::ControlPlane),
            node("prod-worker-1", "10.0.1.5", NodeRole::Worker),
        ];
        let report = orchestrator
            .run(
                &nodes,
                &UpgradeOptions {
                    kubernetes_version: Some("1.32.0".to_string()),
                    dry_run: true,
                    ..options("v1.9.0")
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.upgraded.is_empty());
        assert!(!report.kubernetes_upgraded);
        assert_eq!(report.plan.len(), 3);
        assert!(report.plan[0].contains("v1.7.0 -> v1.9.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_first_attempt() {
        let mut talos = MockTalosApi::new();
        talos.expect_health_check().times(1).returning(|_| Ok(()));

        let attempts = health_check_with_retry(
            &talos,
            "10.0.1.1",
            5,
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_second_attempt() {
        let mut talos = MockTalosApi::new();
        let mut seq = Sequence::new();
        talos
            .expect_health_check()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(TugboatError::TalosError("etcd unhealthy".to_string())));
        talos
            .expect_health_check()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let attempts = health_check_with_retry(
            &talos,
            "10.0.1.1",
            5,
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_honours_cancellation_between_attempts() {
        let mut talos = MockTalosApi::new();
        talos
            .expect_health_check()
            .times(1)
            .returning(|_| Err(TugboatError::TalosError("etcd unhealthy".to_string())));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result =
            health_check_with_retry(&talos, "10.0.1.1", 5, Duration::from_secs(30), &cancel).await;
        assert!(matches!(result, Err(TugboatError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_health_check_aborts_remaining_nodes() {
        let mut talos = MockTalosApi::new();
        talos.expect_version().returning(|_| Ok("v1.8.3".to_string()));
        talos
            .expect_upgrade()
            .withf(|addr, _| addr == "10.0.1.1")
            .times(1)
            .returning(|_, _| Ok(()));
        talos.expect_node_ready().returning(|_| Ok(true));
        talos
            .expect_health_check()
            .times(HEALTH_CHECK_RETRIES as usize)
            .returning(|_| Err(TugboatError::TalosError("etcd unhealthy".to_string())));
        talos.expect_upgrade_kubernetes().never();

        let orchestrator = UpgradeOrchestrator::new(Arc::new(talos));
        let nodes = vec![
            node("prod-cp-1", "10.0.1.1", NodeRole::ControlPlane),
            node("prod-cp-2", "10.0.1.2", NodeRole::ControlPlane),
            node("prod-worker-1", "10.0.1.5", NodeRole::Worker),
        ];
        let result = orchestrator
            .run(
                &nodes,
                &UpgradeOptions {
                    kubernetes_version: Some("1.32.0".to_string()),
                    ..options("v1.9.0")
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(TugboatError::UpgradeAborted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_health_check_and_kubernetes_last() {
        let mut talos = MockTalosApi::new();
        let mut seq = Sequence::new();
        talos
            .expect_version()
            .returning(|addr| Ok(if addr == "10.0.1.5" { "v1.8.3" } else { "v1.9.0" }.to_string()));
        talos
            .expect_upgrade()
            .withf(|addr, req| addr == "10.0.1.5" && req.stage)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        talos.expect_node_ready().returning(|_| Ok(true));
        talos
            .expect_upgrade_kubernetes()
            .withf(|addr, version| addr == "10.0.1.1" && version == "1.32.0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        talos.expect_health_check().never();

        let orchestrator = UpgradeOrchestrator::new(Arc::new(talos));
        let nodes = vec![
            node("prod-cp-1", "10.0.1.1", NodeRole::ControlPlane),
            node("prod-worker-1", "10.0.1.5", NodeRole::Worker),
        ];
        let report = orchestrator
            .run(
                &nodes,
                &UpgradeOptions {
                    kubernetes_version: Some("1.32.0".to_string()),
                    skip_health_check: true,
                    stage: true,
                    ..options("v1.9.0")
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.upgraded, vec!["prod-worker-1"]);
        assert!(report.kubernetes_upgraded);
    }

    /// Talos API whose Kubernetes upgrade runs for half an hour
    struct SlowKubernetesUpgrade;

    #[async_trait::async_trait]
    impl TalosApi for SlowKubernetesUpgrade {
        async fn machine_status(&self, _: &str) -> Result<crate::providers::talos::MachineStatus> {
            Ok(Default::default())
        }
        async fn apply_config(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn bootstrap(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn version(&self, _: &str) -> Result<String> {
            Ok("v1.9.0".to_string())
        }
        async fn upgrade(&self, _: &str, _: &UpgradeRequest) -> Result<()> {
            Ok(())
        }
        async fn upgrade_kubernetes(&self, _: &str, _: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(1800)).await;
            Ok(())
        }
        async fn node_ready(&self, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn health_check(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn kubeconfig(&self, _: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_kubernetes_upgrade() {
        let orchestrator = UpgradeOrchestrator::new(Arc::new(SlowKubernetesUpgrade));
        let nodes = vec![node("prod-cp-1", "10.0.1.1", NodeRole::ControlPlane)];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = orchestrator
            .run(
                &nodes,
                &UpgradeOptions {
                    kubernetes_version: Some("1.32.0".to_string()),
                    ..Default::default()
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(TugboatError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_node_upgrade() {
        let mut talos = MockTalosApi::new();
        talos.expect_version().returning(|_| Ok("v1.8.3".to_string()));
        talos.expect_upgrade().never();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let orchestrator = UpgradeOrchestrator::new(Arc::new(talos));
        let nodes = vec![node("prod-cp-1", "10.0.1.1", NodeRole::ControlPlane)];
        let result = orchestrator.run(&nodes, &options("v1.9.0"), &cancel).await;

        assert!(matches!(result, Err(TugboatError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_node_ready_times_out() {
        let mut talos = MockTalosApi::new();
        talos.expect_node_ready().returning(|_| Ok(false));

        let result = wait_for_node_ready(
            &talos,
            "10.0.1.1",
            Duration::from_secs(60),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(TugboatError::Timeout(_))));
    }

    #[test]
    fn test_nodes_from_status_skips_unaddressed_and_terminal() {
        use crate::types::{NodePhase, NodeStatus};

        let mut status = TalosClusterStatus::default();
        status.control_planes.nodes = vec![
            NodeStatus {
                name: "prod-cp-1".to_string(),
                public_ip: Some("1.2.3.4".to_string()),
                phase: NodePhase::Ready,
                ..Default::default()
            },
            NodeStatus {
                name: "prod-cp-2".to_string(),
                phase: NodePhase::CreatingServer,
                ..Default::default()
            },
        ];
        status.workers.nodes = vec![NodeStatus {
            name: "prod-worker-1".to_string(),
            private_ip: Some("10.0.1.5".to_string()),
            phase: NodePhase::Failed,
            ..Default::default()
        }];

        let nodes = nodes_from_status(&status);
        assert_eq!(nodes, vec![node("prod-cp-1", "1.2.3.4", NodeRole::ControlPlane)]);
    }
}
