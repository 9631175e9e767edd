// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Builds the per-pass observation snapshot of a node from the cloud
//! provider, the Talos API and the workload cluster's Kubernetes API.

use crate::constants::observe::{CLOUD_TIMEOUT, KUBERNETES_TIMEOUT, TALOS_TIMEOUT};
use crate::error::{Result, TugboatError};
use crate::kubernetes::WorkloadApi;
use crate::providers::{CloudProvider, TalosApi};
use crate::types::{NodeStateInfo, NodeStatus, ServerState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

/// Snapshot of one node plus the addresses and server handle seen with it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub info: NodeStateInfo,
    pub server_id: Option<i64>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeObserver: Send + Sync {
    /// Observe a node. Only a failed cloud lookup is an error: without it the
    /// existence of the server is unknown. Talos and Kubernetes failures
    /// degrade to "not reachable" / "not ready".
    async fn observe(&self, node: &NodeStatus) -> Result<Observation>;
}

/// Observer for one pass. The workload cluster's node list is fetched once,
/// on first use, and shared by every node observed through this instance.
pub struct ClusterObserver {
    cloud: Arc<dyn CloudProvider>,
    talos: Arc<dyn TalosApi>,
    workload: Option<Arc<dyn WorkloadApi>>,
    /// Node name to ready; None when the list could not be fetched
    nodes: OnceCell<Option<HashMap<String, bool>>>,
}

impl ClusterObserver {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        talos: Arc<dyn TalosApi>,
        workload: Option<Arc<dyn WorkloadApi>>,
    ) -> Self {
        Self {
            cloud,
            talos,
            workload,
            nodes: OnceCell::new(),
        }
    }

    async fn observe_talos(&self, ip: &str, info: &mut NodeStateInfo) {
        match tokio::time::timeout(TALOS_TIMEOUT, self.talos.machine_status(ip)).await {
            Ok(Ok(status)) => {
                info.talos_api_reachable = true;
                info.talos_in_maintenance_mode = status.maintenance;
                info.talos_configured = status.configured;
                info.talos_kubelet_running = status.kubelet_running;
            }
            Ok(Err(e)) => debug!("Talos API of {} not reachable: {}", ip, e),
            Err(_) => debug!("Talos API of {} timed out", ip),
        }
    }

    async fn observe_kubernetes(&self, name: &str, info: &mut NodeStateInfo) {
        let Some(workload) = &self.workload else {
            return;
        };
        let nodes = self
            .nodes
            .get_or_init(|| async {
                match tokio::time::timeout(KUBERNETES_TIMEOUT, workload.list_nodes()).await {
                    Ok(Ok(nodes)) => Some(nodes.into_iter().map(|n| (n.name, n.ready)).collect()),
                    Ok(Err(e)) => {
                        debug!("Listing Kubernetes nodes failed: {}", e);
                        None
                    }
                    Err(_) => {
                        debug!("Listing Kubernetes nodes timed out");
                        None
                    }
                }
            })
            .await;
        if let Some(ready) = nodes.as_ref().and_then(|nodes| nodes.get(name)) {
            info.k8s_node_exists = true;
            info.k8s_node_ready = *ready;
        }
    }
}

/// Address to reach a node on: live cloud data first, then what was last
/// recorded in status.
pub fn select_ip(
    live_public: Option<&str>,
    live_private: Option<&str>,
    recorded: &NodeStatus,
) -> Option<String> {
    live_public
        .or(live_private)
        .or(recorded.public_ip.as_deref())
        .or(recorded.private_ip.as_deref())
        .map(str::to_string)
}

#[async_trait]
impl NodeObserver for ClusterObserver {
    #[instrument(skip(self, node), fields(node = %node.name))]
    async fn observe(&self, node: &NodeStatus) -> Result<Observation> {
        let server = tokio::time::timeout(CLOUD_TIMEOUT, self.cloud.get_server_by_name(&node.name))
            .await
            .map_err(|_| TugboatError::ObservationError {
                node: node.name.clone(),
                message: "cloud provider lookup timed out".to_string(),
            })?
            .map_err(|e| TugboatError::ObservationError {
                node: node.name.clone(),
                message: e.to_string(),
            })?;

        let Some(server) = server else {
            return Ok(Observation::default());
        };

        let ip = select_ip(
            server.public_ip.as_deref(),
            server.private_ip.as_deref(),
            node,
        );
        let mut info = NodeStateInfo {
            server_exists: true,
            server_status: server.status,
            server_ip: ip.clone(),
            ..Default::default()
        };

        if server.status == ServerState::Running {
            if let Some(ip) = &ip {
                self.observe_talos(ip, &mut info).await;
            }
        }
        self.observe_kubernetes(&node.name, &mut info).await;

        Ok(Observation {
            info,
            server_id: Some(server.id),
            public_ip: server.public_ip.or_else(|| node.public_ip.clone()),
            private_ip: server.private_ip.or_else(|| node.private_ip.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::workload::MockWorkloadApi;
    use crate::kubernetes::ClusterNode;
    use crate::providers::hcloud::{MockCloudProvider, Server};
    use crate::providers::talos::{MachineStatus, MockTalosApi};
    use std::collections::BTreeMap;

    fn node(public_ip: Option<&str>, private_ip: Option<&str>) -> NodeStatus {
        NodeStatus {
            name: "prod-cp-1".to_string(),
            public_ip: public_ip.map(str::to_string),
            private_ip: private_ip.map(str::to_string),
            ..Default::default()
        }
    }

    fn server(status: ServerState, public_ip: Option<&str>) -> Server {
        Server {
            id: 7,
            name: "prod-cp-1".to_string(),
            status,
            public_ip: public_ip.map(str::to_string),
            private_ip: Some("10.0.1.2".to_string()),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_select_ip_prefers_live_address() {
        let recorded = node(Some("1.1.1.1"), Some("10.0.1.9"));
        assert_eq!(
            select_ip(Some("2.2.2.2"), None, &recorded).as_deref(),
            Some("2.2.2.2")
        );
        assert_eq!(
            select_ip(None, None, &recorded).as_deref(),
            Some("1.1.1.1")
        );
        assert_eq!(
            select_ip(None, None, &node(None, Some("10.0.1.9"))).as_deref(),
            Some("10.0.1.9")
        );
        assert_eq!(select_ip(None, None, &node(None, None)), None);
    }

    #[tokio::test]
    async fn test_missing_server_observes_nothing_else() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_get_server_by_name().returning(|_| Ok(None));
        let mut talos = MockTalosApi::new();
        talos.expect_machine_status().never();

        let observer = ClusterObserver::new(Arc::new(cloud), Arc::new(talos), None);
        let observation = observer.observe(&node(None, None)).await.unwrap();

        assert!(!observation.info.server_exists);
        assert_eq!(observation.server_id, None);
    }

    #[tokio::test]
    async fn test_cloud_failure_is_an_observation_error() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_get_server_by_name().returning(|_| {
            Err(TugboatError::CloudApiError {
                status: 503,
                code: "unavailable".to_string(),
                message: "maintenance".to_string(),
            })
        });

        let observer = ClusterObserver::new(Arc::new(cloud), Arc::new(MockTalosApi::new()), None);
        let err = observer.observe(&node(None, None)).await.unwrap_err();

        assert!(matches!(err, TugboatError::ObservationError { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_talos_defaults_to_false() {
        let mut cloud = MockCloudProvider::new();
        cloud
            .expect_get_server_by_name()
            .returning(|_| Ok(Some(server(ServerState::Running, Some("5.6.7.8")))));
        let mut talos = MockTalosApi::new();
        talos
            .expect_machine_status()
            .returning(|_| Err(TugboatError::TalosError("connection refused".to_string())));

        let observer = ClusterObserver::new(Arc::new(cloud), Arc::new(talos), None);
        let observation = observer.observe(&node(None, None)).await.unwrap();

        assert!(observation.info.server_exists);
        assert_eq!(observation.info.server_ip.as_deref(), Some("5.6.7.8"));
        assert!(!observation.info.talos_api_reachable);
        assert_eq!(observation.server_id, Some(7));
        assert_eq!(observation.private_ip.as_deref(), Some("10.0.1.2"));
    }

    #[tokio::test]
    async fn test_full_observation() {
        let mut cloud = MockCloudProvider::new();
        cloud
            .expect_get_server_by_name()
            .returning(|_| Ok(Some(server(ServerState::Running, Some("5.6.7.8")))));
        let mut talos = MockTalosApi::new();
        talos
            .expect_machine_status()
            .withf(|ip| ip == "5.6.7.8")
            .returning(|_| {
                Ok(MachineStatus {
                    configured: true,
                    kubelet_running: true,
                    ..Default::default()
                })
            });
        let mut workload = MockWorkloadApi::new();
        workload.expect_list_nodes().returning(|| {
            Ok(vec![ClusterNode {
                name: "prod-cp-1".to_string(),
                ready: true,
            }])
        });

        let observer =
            ClusterObserver::new(Arc::new(cloud), Arc::new(talos), Some(Arc::new(workload)));
        let info = observer.observe(&node(None, None)).await.unwrap().info;

        assert!(info.talos_configured);
        assert!(info.talos_kubelet_running);
        assert!(info.k8s_node_exists);
        assert!(info.k8s_node_ready);
    }

    #[tokio::test]
    async fn test_starting_server_skips_talos() {
        let mut cloud = MockCloudProvider::new();
        cloud
            .expect_get_server_by_name()
            .returning(|_| Ok(Some(server(ServerState::Starting, None))));
        let mut talos = MockTalosApi::new();
        talos.expect_machine_status().never();

        let observer = ClusterObserver::new(Arc::new(cloud), Arc::new(talos), None);
        let observation = observer.observe(&node(None, None)).await.unwrap();

        assert_eq!(observation.info.server_status, ServerState::Starting);
        assert_eq!(observation.info.server_ip.as_deref(), Some("10.0.1.2"));
    }

    #[tokio::test]
    async fn test_node_list_is_fetched_once_per_observer() {
        let mut cloud = MockCloudProvider::new();
        cloud
            .expect_get_server_by_name()
            .returning(|_| Ok(Some(server(ServerState::Off, None))));
        let mut workload = MockWorkloadApi::new();
        workload.expect_list_nodes().times(1).returning(|| {
            Ok(vec![ClusterNode {
                name: "prod-cp-1".to_string(),
                ready: false,
            }])
        });

        let observer = ClusterObserver::new(
            Arc::new(cloud),
            Arc::new(MockTalosApi::new()),
            Some(Arc::new(workload)),
        );
        let registered = observer.observe(&node(None, None)).await.unwrap().info;
        let missing = NodeStatus {
            name: "prod-worker-1".to_string(),
            ..Default::default()
        };
        let unregistered = observer.observe(&missing).await.unwrap().info;

        assert!(registered.k8s_node_exists);
        assert!(!registered.k8s_node_ready);
        assert!(!unregistered.k8s_node_exists);
    }

    #[tokio::test]
    async fn test_failed_node_list_degrades_to_unregistered() {
        let mut cloud = MockCloudProvider::new();
        cloud
            .expect_get_server_by_name()
            .returning(|_| Ok(Some(server(ServerState::Off, None))));
        let mut workload = MockWorkloadApi::new();
        workload
            .expect_list_nodes()
            .times(1)
            .returning(|| Err(TugboatError::KubeconfigError("unreachable".to_string())));

        let observer = ClusterObserver::new(
            Arc::new(cloud),
            Arc::new(MockTalosApi::new()),
            Some(Arc::new(workload)),
        );
        for _ in 0..2 {
            let info = observer.observe(&node(None, None)).await.unwrap().info;
            assert!(info.server_exists);
            assert!(!info.k8s_node_exists);
        }
    }
}
