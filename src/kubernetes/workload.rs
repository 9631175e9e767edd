// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes API of a provisioned (workload) cluster.

use crate::constants::OPERATOR_NAME;
use crate::error::{Result, TugboatError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::{
    api::{DynamicObject, GroupVersionKind, ListParams, ObjectMeta, PostParams},
    discovery::{self, Scope},
    Api, Client, ResourceExt,
};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

/// A Kubernetes node and its readiness
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    pub name: String,
    pub ready: bool,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>>;

    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn daemonset_ready(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Create the object; if it already exists, replace it
    async fn apply(&self, object: &DynamicObject) -> Result<()>;
}

pub struct KubeWorkloadApi {
    client: Client,
}

impl KubeWorkloadApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn dynamic_api(&self, object: &DynamicObject) -> Result<Api<DynamicObject>> {
        let types = object.types.as_ref().ok_or_else(|| {
            TugboatError::RenderError(format!("object {} has no apiVersion/kind", object.name_any()))
        })?;
        let gvk = parse_gvk(&types.api_version, &types.kind);
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk).await?;

        Ok(match caps.scope {
            Scope::Namespaced => {
                let namespace = object.namespace().unwrap_or_else(|| "default".to_string());
                Api::namespaced_with(self.client.clone(), &namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }
}

fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn deployment_is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready >= desired
}

fn daemonset_is_ready(daemonset: &DaemonSet) -> bool {
    daemonset.status.as_ref().is_some_and(|s| {
        s.desired_number_scheduled > 0 && s.number_ready >= s.desired_number_scheduled
    })
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn list_nodes(&self) -> Result<Vec<ClusterNode>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(|node| ClusterNode {
                name: node.name_any(),
                ready: node_is_ready(node),
            })
            .collect())
    }

    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments
            .get_opt(name)
            .await?
            .is_some_and(|d| deployment_is_ready(&d)))
    }

    async fn daemonset_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let daemonsets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(daemonsets
            .get_opt(name)
            .await?
            .is_some_and(|d| daemonset_is_ready(&d)))
    }

    #[instrument(skip(self))]
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.get(name).await {
            Ok(_) => {
                debug!("Namespace {} already exists", name);
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                info!("Creating namespace {}", name);
                let ns = Namespace {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match namespaces.create(&PostParams::default(), &ns).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
                    Err(e) => Err(TugboatError::NamespaceError(format!(
                        "Failed to create namespace {}: {}",
                        name, e
                    ))),
                }
            }
            Err(e) => Err(TugboatError::NamespaceError(format!(
                "Failed to check namespace {}: {}",
                name, e
            ))),
        }
    }

    #[instrument(skip(self, object), fields(object = %object.name_any()))]
    async fn apply(&self, object: &DynamicObject) -> Result<()> {
        let api = self.dynamic_api(object).await?;
        let name = object.name_any();
        let pp = PostParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        };

        match api.create(&pp, object).await {
            Ok(_) => {
                debug!("Created {}", name);
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let existing = api.get(&name).await?;
                let mut updated = object.clone();
                updated.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &pp, &updated).await?;
                debug!("Updated {}", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{namespace_json, not_found_json, MockService};
    use serde_json::json;

    fn core_resources_json() -> String {
        json!({
            "kind": "APIResourceList",
            "apiVersion": "v1",
            "groupVersion": "v1",
            "resources": [{
                "name": "configmaps",
                "singularName": "configmap",
                "namespaced": true,
                "kind": "ConfigMap",
                "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"]
            }]
        })
        .to_string()
    }

    fn configmap_json(resource_version: &str) -> String {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "namespace": "kube-system",
                "resourceVersion": resource_version
            },
            "data": { "key": "value" }
        })
        .to_string()
    }

    fn configmap_object() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "kube-system" },
            "data": { "key": "value" }
        }))
        .unwrap()
    }

    fn conflict_json() -> String {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "configmaps \"settings\" already exists",
            "reason": "AlreadyExists",
            "code": 409
        })
        .to_string()
    }

    #[test]
    fn test_parse_gvk() {
        let gvk = parse_gvk("apps/v1", "Deployment");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");

        let gvk = parse_gvk("v1", "Secret");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[tokio::test]
    async fn test_apply_creates_new_object() {
        let mock = MockService::new()
            .on_get("/api/v1", 200, &core_resources_json())
            .on_post("/api/v1/namespaces/kube-system/configmaps", 201, &configmap_json("1"));
        let api = KubeWorkloadApi::new(mock.clone().into_client());

        api.apply(&configmap_object()).await.unwrap();

        let methods: Vec<_> = mock.requests().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["GET", "POST"]);
    }

    #[tokio::test]
    async fn test_apply_updates_on_conflict() {
        let path = "/api/v1/namespaces/kube-system/configmaps/settings";
        let mock = MockService::new()
            .on_get("/api/v1", 200, &core_resources_json())
            .on_post("/api/v1/namespaces/kube-system/configmaps", 409, &conflict_json())
            .on_get(path, 200, &configmap_json("7"))
            .on_put(path, 200, &configmap_json("8"));
        let api = KubeWorkloadApi::new(mock.clone().into_client());

        api.apply(&configmap_object()).await.unwrap();

        let requests = mock.requests();
        let methods: Vec<_> = requests.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["GET", "POST", "GET", "PUT"]);
        assert_eq!(requests[3].1, path);
    }

    #[tokio::test]
    async fn test_list_nodes_ready_condition() {
        let nodes = json!({
            "apiVersion": "v1",
            "kind": "NodeList",
            "metadata": { "resourceVersion": "1" },
            "items": [
                {
                    "metadata": { "name": "prod-cp-1" },
                    "status": { "conditions": [
                        { "type": "MemoryPressure", "status": "False" },
                        { "type": "Ready", "status": "True" }
                    ]}
                },
                {
                    "metadata": { "name": "prod-worker-1" },
                    "status": { "conditions": [{ "type": "Ready", "status": "False" }] }
                },
                { "metadata": { "name": "prod-worker-2" } }
            ]
        });
        let mock = MockService::new().on_get("/api/v1/nodes", 200, &nodes.to_string());
        let api = KubeWorkloadApi::new(mock.into_client());

        let nodes = api.list_nodes().await.unwrap();
        assert_eq!(
            nodes,
            vec![
                ClusterNode { name: "prod-cp-1".to_string(), ready: true },
                ClusterNode { name: "prod-worker-1".to_string(), ready: false },
                ClusterNode { name: "prod-worker-2".to_string(), ready: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_namespace_exists() {
        let mock = MockService::new().on_get("/api/v1/namespaces/cert-manager", 200, &namespace_json("cert-manager"));
        let api = KubeWorkloadApi::new(mock.clone().into_client());

        api.ensure_namespace("cert-manager").await.unwrap();
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_namespace_creates_missing() {
        let mock = MockService::new()
            .on_get(
                "/api/v1/namespaces/cert-manager",
                404,
                &not_found_json("namespaces", "cert-manager"),
            )
            .on_post("/api/v1/namespaces", 201, &namespace_json("cert-manager"));
        let api = KubeWorkloadApi::new(mock.clone().into_client());

        api.ensure_namespace("cert-manager").await.unwrap();

        let methods: Vec<_> = mock.requests().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["GET", "POST"]);
    }

    #[test]
    fn test_deployment_readiness() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "hcloud-cloud-controller-manager" },
            "spec": { "replicas": 2, "selector": {}, "template": {} },
            "status": { "readyReplicas": 1 }
        }))
        .unwrap();
        assert!(!deployment_is_ready(&deployment));

        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "hcloud-cloud-controller-manager" },
            "spec": { "replicas": 2, "selector": {}, "template": {} },
            "status": { "readyReplicas": 2 }
        }))
        .unwrap();
        assert!(deployment_is_ready(&deployment));
    }

    #[test]
    fn test_daemonset_readiness() {
        let daemonset: DaemonSet = serde_json::from_value(json!({
            "metadata": { "name": "cilium" },
            "status": {
                "desiredNumberScheduled": 3,
                "numberReady": 3,
                "currentNumberScheduled": 3,
                "numberMisscheduled": 0
            }
        }))
        .unwrap();
        assert!(daemonset_is_ready(&daemonset));

        let daemonset: DaemonSet = serde_json::from_value(json!({
            "metadata": { "name": "cilium" },
            "status": {
                "desiredNumberScheduled": 0,
                "numberReady": 0,
                "currentNumberScheduled": 0,
                "numberMisscheduled": 0
            }
        }))
        .unwrap();
        assert!(!daemonset_is_ready(&daemonset));
    }
}
