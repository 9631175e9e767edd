// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Built-in addons, each a Helm chart plus the workloads that prove it runs.

use super::{Addon, AddonContext};
use crate::error::Result;
use crate::kubernetes::WorkloadApi;
use crate::providers::ChartRef;
use crate::types::TalosClusterSpec;
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    Deployment(&'static str),
    DaemonSet(&'static str),
}

type ValuesFn = fn(&AddonContext<'_>) -> Value;
type ExtraFn = fn(&AddonContext<'_>) -> Result<Vec<DynamicObject>>;

pub struct HelmAddon {
    name: &'static str,
    namespace: &'static str,
    repo: &'static str,
    chart: &'static str,
    version: &'static str,
    dependencies: &'static [&'static str],
    default_enabled: bool,
    cni: bool,
    workloads: &'static [Workload],
    values: ValuesFn,
    extra: Option<ExtraFn>,
}

impl HelmAddon {
    fn chart_ref(&self, spec: &TalosClusterSpec) -> ChartRef {
        let version = spec
            .addons
            .toggle(self.name)
            .and_then(|t| t.version.clone())
            .unwrap_or_else(|| self.version.to_string());
        ChartRef {
            repo: self.repo.to_string(),
            chart: self.chart.to_string(),
            version,
            release: self.name.to_string(),
            namespace: self.namespace.to_string(),
        }
    }
}

#[async_trait]
impl Addon for HelmAddon {
    fn name(&self) -> &'static str {
        self.name
    }

    fn dependencies(&self) -> &[&'static str] {
        self.dependencies
    }

    fn enabled(&self, spec: &TalosClusterSpec) -> bool {
        spec.addons
            .toggle(self.name)
            .and_then(|t| t.enabled)
            .unwrap_or(self.default_enabled)
    }

    fn is_cni(&self) -> bool {
        self.cni
    }

    fn namespace(&self) -> &'static str {
        self.namespace
    }

    async fn manifests(&self, ctx: &AddonContext<'_>) -> Result<Vec<DynamicObject>> {
        let mut objects = match self.extra {
            Some(extra) => extra(ctx)?,
            None => Vec::new(),
        };
        let chart = self.chart_ref(&ctx.cluster.spec);
        let rendered = ctx.renderer.render(&chart, &(self.values)(ctx)).await?;

        // helm template leaves the namespace off namespaced objects
        objects.extend(rendered.into_iter().map(|mut object| {
            if object.namespace().is_none() {
                object.metadata.namespace = Some(self.namespace.to_string());
            }
            object
        }));
        Ok(objects)
    }

    async fn verify(&self, api: &dyn WorkloadApi) -> Result<bool> {
        for workload in self.workloads {
            let ready = match workload {
                Workload::Deployment(name) => api.deployment_ready(self.namespace, name).await?,
                Workload::DaemonSet(name) => api.daemonset_ready(self.namespace, name).await?,
            };
            if !ready {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn cilium_values(_: &AddonContext<'_>) -> Value {
    // Talos runs without kube-proxy and exposes the API server on KubePrism
    json!({
        "ipam": { "mode": "kubernetes" },
        "kubeProxyReplacement": true,
        "k8sServiceHost": "localhost",
        "k8sServicePort": 7445,
        "cgroup": {
            "autoMount": { "enabled": false },
            "hostRoot": "/sys/fs/cgroup"
        },
        "securityContext": {
            "capabilities": {
                "ciliumAgent": [
                    "CHOWN", "KILL", "NET_ADMIN", "NET_RAW", "IPC_LOCK", "SYS_ADMIN",
                    "SYS_RESOURCE", "DAC_OVERRIDE", "FOWNER", "SETGID", "SETUID"
                ],
                "cleanCiliumState": ["NET_ADMIN", "SYS_ADMIN", "SYS_RESOURCE"]
            }
        }
    })
}

fn ccm_values(ctx: &AddonContext<'_>) -> Value {
    json!({
        "networking": {
            "enabled": true,
            "clusterCIDR": ctx.cluster.spec.network.pod_subnet
        }
    })
}

/// Token and network id the cloud controller and CSI driver read
fn hcloud_secret(ctx: &AddonContext<'_>) -> Result<Vec<DynamicObject>> {
    let network = ctx
        .cluster
        .status
        .as_ref()
        .and_then(|s| s.infrastructure.network_id)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let secret = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "hcloud", "namespace": "kube-system" },
        "stringData": {
            "token": ctx.hcloud_token,
            "network": network
        }
    }))?;
    Ok(vec![secret])
}

fn no_values(_: &AddonContext<'_>) -> Value {
    json!({})
}

fn metrics_server_values(_: &AddonContext<'_>) -> Value {
    json!({ "args": ["--kubelet-insecure-tls"] })
}

fn cert_manager_values(_: &AddonContext<'_>) -> Value {
    json!({ "crds": { "enabled": true } })
}

fn ingress_nginx_values(ctx: &AddonContext<'_>) -> Value {
    json!({
        "controller": {
            "kind": "Deployment",
            "service": {
                "annotations": {
                    "load-balancer.hetzner.cloud/location": ctx.cluster.spec.location,
                    "load-balancer.hetzner.cloud/use-private-ip": "true"
                }
            }
        }
    })
}

/// All built-in addons in declaration order
pub fn builtin_addons() -> Vec<Arc<dyn Addon>> {
    vec![
        Arc::new(HelmAddon {
            name: "cilium",
            namespace: "kube-system",
            repo: "https://helm.cilium.io",
            chart: "cilium",
            version: "1.16.5",
            dependencies: &[],
            default_enabled: true,
            cni: true,
            workloads: &[
                Workload::DaemonSet("cilium"),
                Workload::Deployment("cilium-operator"),
            ],
            values: cilium_values,
            extra: None,
        }),
        Arc::new(HelmAddon {
            name: "hcloud-ccm",
            namespace: "kube-system",
            repo: "https://charts.hetzner.cloud",
            chart: "hcloud-cloud-controller-manager",
            version: "1.21.0",
            dependencies: &[],
            default_enabled: true,
            cni: false,
            workloads: &[Workload::Deployment("hcloud-cloud-controller-manager")],
            values: ccm_values,
            extra: Some(hcloud_secret),
        }),
        Arc::new(HelmAddon {
            name: "hcloud-csi",
            namespace: "kube-system",
            repo: "https://charts.hetzner.cloud",
            chart: "hcloud-csi",
            version: "2.11.0",
            dependencies: &["hcloud-ccm"],
            default_enabled: true,
            cni: false,
            workloads: &[
                Workload::Deployment("hcloud-csi-controller"),
                Workload::DaemonSet("hcloud-csi-node"),
            ],
            values: no_values,
            extra: None,
        }),
        Arc::new(HelmAddon {
            name: "metrics-server",
            namespace: "kube-system",
            repo: "https://kubernetes-sigs.github.io/metrics-server/",
            chart: "metrics-server",
            version: "3.12.2",
            dependencies: &[],
            default_enabled: false,
            cni: false,
            workloads: &[Workload::Deployment("metrics-server")],
            values: metrics_server_values,
            extra: None,
        }),
        Arc::new(HelmAddon {
            name: "cert-manager",
            namespace: "cert-manager",
            repo: "https://charts.jetstack.io",
            chart: "cert-manager",
            version: "v1.16.2",
            dependencies: &[],
            default_enabled: false,
            cni: false,
            workloads: &[
                Workload::Deployment("cert-manager"),
                Workload::Deployment("cert-manager-webhook"),
                Workload::Deployment("cert-manager-cainjector"),
            ],
            values: cert_manager_values,
            extra: None,
        }),
        Arc::new(HelmAddon {
            name: "ingress-nginx",
            namespace: "ingress-nginx",
            repo: "https://kubernetes.github.io/ingress-nginx",
            chart: "ingress-nginx",
            version: "4.11.3",
            dependencies: &["hcloud-ccm"],
            default_enabled: false,
            cni: false,
            workloads: &[Workload::Deployment("ingress-nginx-controller")],
            values: ingress_nginx_values,
            extra: None,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::workload::MockWorkloadApi;
    use crate::providers::helm::MockManifestRenderer;
    use crate::types::TalosCluster;

    fn cluster(addons: Value) -> TalosCluster {
        let spec = serde_json::from_value(json!({
            "location": "fsn1",
            "controlPlanes": [{ "name": "cp", "serverType": "cx22", "count": 3 }],
            "talosVersion": "v1.9.0",
            "kubernetesVersion": "1.31.0",
            "addons": addons
        }))
        .unwrap();
        TalosCluster::new("prod", spec)
    }

    fn find(name: &str) -> Arc<dyn Addon> {
        builtin_addons()
            .into_iter()
            .find(|a| a.name() == name)
            .unwrap()
    }

    #[test]
    fn test_default_enablement() {
        let spec = cluster(json!({})).spec;
        let enabled: Vec<_> = builtin_addons()
            .iter()
            .filter(|a| a.enabled(&spec))
            .map(|a| a.name())
            .collect();
        assert_eq!(enabled, vec!["cilium", "hcloud-ccm", "hcloud-csi"]);
    }

    #[test]
    fn test_toggle_overrides_default() {
        let spec = cluster(json!({
            "hcloudCsi": { "enabled": false },
            "certManager": { "enabled": true }
        }))
        .spec;
        assert!(!find("hcloud-csi").enabled(&spec));
        assert!(find("cert-manager").enabled(&spec));
    }

    #[tokio::test]
    async fn test_manifests_use_version_override_and_namespace() {
        let cluster = cluster(json!({ "cilium": { "version": "1.17.0" } }));
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .withf(|chart, values| {
                chart.version == "1.17.0"
                    && chart.namespace == "kube-system"
                    && values["kubeProxyReplacement"] == json!(true)
            })
            .returning(|_, _| {
                Ok(vec![serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "ServiceAccount",
                    "metadata": { "name": "cilium" }
                }))
                .unwrap()])
            });
        let ctx = AddonContext {
            cluster: &cluster,
            hcloud_token: "token",
            renderer: &renderer,
        };

        let objects = find("cilium").manifests(&ctx).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("kube-system"));
    }

    #[tokio::test]
    async fn test_ccm_cluster_cidr_is_pod_subnet() {
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .withf(|_, values| values["networking"]["clusterCIDR"] == json!("10.244.0.0/16"))
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        let cluster = cluster(json!({}));
        let ctx = AddonContext {
            cluster: &cluster,
            hcloud_token: "token",
            renderer: &renderer,
        };
        find("hcloud-ccm").manifests(&ctx).await.unwrap();

        let mut custom = cluster.clone();
        custom.spec.network.pod_subnet = "172.16.0.0/16".to_string();
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .withf(|_, values| values["networking"]["clusterCIDR"] == json!("172.16.0.0/16"))
            .times(1)
            .returning(|_, _| Ok(Vec::new()));
        let ctx = AddonContext {
            cluster: &custom,
            hcloud_token: "token",
            renderer: &renderer,
        };
        find("hcloud-ccm").manifests(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_ccm_ships_token_secret() {
        let cluster = cluster(json!({}));
        let mut renderer = MockManifestRenderer::new();
        renderer.expect_render().returning(|_, _| Ok(Vec::new()));
        let ctx = AddonContext {
            cluster: &cluster,
            hcloud_token: "secret-token",
            renderer: &renderer,
        };

        let objects = find("hcloud-ccm").manifests(&ctx).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name_any(), "hcloud");
        assert_eq!(objects[0].data["stringData"]["token"], "secret-token");
    }

    #[tokio::test]
    async fn test_verify_checks_every_workload() {
        let mut api = MockWorkloadApi::new();
        api.expect_deployment_ready()
            .withf(|_, name| name == "hcloud-csi-controller")
            .returning(|_, _| Ok(true));
        api.expect_daemonset_ready()
            .withf(|_, name| name == "hcloud-csi-node")
            .returning(|_, _| Ok(false));

        assert!(!find("hcloud-csi").verify(&api).await.unwrap());
    }
}
