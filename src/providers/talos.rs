// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Talos node management API, driven through the `talosctl` binary.
//!
//! Every invocation has a timeout and the child process is killed when the
//! future is dropped, so cancelling a caller never leaves `talosctl` running.

use crate::constants::DEFAULT_POD_SUBNET;
use crate::error::{Result, TugboatError};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(180);

/// Machine state as reported by the Talos API of one node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineStatus {
    pub maintenance: bool,
    pub configured: bool,
    pub kubelet_running: bool,
    /// Machine reports stage `running` with all conditions met
    pub ready: bool,
}

/// Output of `talosctl gen config`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedConfig {
    pub control_plane: String,
    pub worker: String,
    pub talosconfig: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigRequest {
    pub cluster_name: String,
    /// `https://<lb>:6443`
    pub endpoint: String,
    pub talos_version: String,
    pub kubernetes_version: String,
    pub installer_image: String,
    pub additional_sans: Vec<String>,
    pub pod_subnet: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub image: String,
    pub stage: bool,
    pub force: bool,
}

/// Talos API for one cluster. Node arguments are IP addresses.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TalosApi: Send + Sync {
    async fn machine_status(&self, node: &str) -> Result<MachineStatus>;

    /// Apply a machine config to a node waiting in maintenance mode
    async fn apply_config(&self, node: &str, config: &str) -> Result<()>;

    /// Bootstrap etcd; must run exactly once per cluster
    async fn bootstrap(&self, node: &str) -> Result<()>;

    async fn version(&self, node: &str) -> Result<String>;

    async fn upgrade(&self, node: &str, request: &UpgradeRequest) -> Result<()>;

    async fn upgrade_kubernetes(&self, endpoint: &str, version: &str) -> Result<()>;

    async fn node_ready(&self, node: &str) -> Result<bool>;

    async fn health_check(&self, endpoint: &str) -> Result<()>;

    /// Admin kubeconfig of the cluster
    async fn kubeconfig(&self, endpoint: &str) -> Result<String>;
}

/// Generates machine configs and opens per-cluster Talos connections
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TalosConnector: Send + Sync {
    async fn generate_config(&self, request: &ConfigRequest) -> Result<GeneratedConfig>;

    /// Without a talosconfig only maintenance-mode calls succeed
    fn connect(
        &self,
        namespace: &str,
        cluster: &str,
        talosconfig: Option<String>,
    ) -> Result<Arc<dyn TalosApi>>;
}

pub struct TalosctlConnector {
    binary: PathBuf,
    state_dir: PathBuf,
}

impl TalosctlConnector {
    pub fn new(binary: PathBuf, state_dir: PathBuf) -> Self {
        Self { binary, state_dir }
    }

    /// Client with its own copy of the talosconfig, stored under
    /// `<state_dir>/<namespace>/<cluster>` and removed when the client drops
    pub fn client(
        &self,
        namespace: &str,
        cluster: &str,
        talosconfig: Option<String>,
    ) -> Result<TalosctlClient> {
        let dir = self.state_dir.join(namespace).join(cluster);
        std::fs::create_dir_all(&dir)?;

        let talosconfig = match talosconfig {
            Some(content) => {
                let mut file = tempfile::Builder::new()
                    .prefix("talosconfig-")
                    .tempfile_in(&dir)?;
                file.write_all(content.as_bytes())?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };

        Ok(TalosctlClient {
            binary: self.binary.clone(),
            talosconfig,
            scratch_dir: dir,
        })
    }
}

#[async_trait]
impl TalosConnector for TalosctlConnector {
    #[instrument(skip(self, request), fields(cluster = %request.cluster_name))]
    async fn generate_config(&self, request: &ConfigRequest) -> Result<GeneratedConfig> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("gen-")
            .tempdir_in(&self.state_dir)?;

        let mut args = vec![
            "gen".to_string(),
            "config".to_string(),
            request.cluster_name.clone(),
            request.endpoint.clone(),
            "--output-dir".to_string(),
            dir.path().display().to_string(),
            "--kubernetes-version".to_string(),
            request.kubernetes_version.clone(),
            "--talos-version".to_string(),
            minor_version(&request.talos_version),
            "--install-image".to_string(),
            request.installer_image.clone(),
            "--with-docs=false".to_string(),
            "--with-examples=false".to_string(),
        ];
        for san in &request.additional_sans {
            args.push("--additional-sans".to_string());
            args.push(san.clone());
        }
        if let Some(patch) = pod_subnet_patch(&request.pod_subnet) {
            args.push("--config-patch".to_string());
            args.push(patch);
        }

        run_talosctl(&self.binary, &args, COMMAND_TIMEOUT).await?;

        Ok(GeneratedConfig {
            control_plane: tokio::fs::read_to_string(dir.path().join("controlplane.yaml")).await?,
            worker: tokio::fs::read_to_string(dir.path().join("worker.yaml")).await?,
            talosconfig: tokio::fs::read_to_string(dir.path().join("talosconfig")).await?,
        })
    }

    fn connect(
        &self,
        namespace: &str,
        cluster: &str,
        talosconfig: Option<String>,
    ) -> Result<Arc<dyn TalosApi>> {
        Ok(Arc::new(self.client(namespace, cluster, talosconfig)?))
    }
}

pub struct TalosctlClient {
    binary: PathBuf,
    talosconfig: Option<NamedTempFile>,
    scratch_dir: PathBuf,
}

impl TalosctlClient {
    pub fn talosconfig_path(&self) -> Option<&Path> {
        self.talosconfig.as_ref().map(NamedTempFile::path)
    }

    fn node_args(&self, node: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = self.talosconfig_path() {
            args.push("--talosconfig".to_string());
            args.push(path.display().to_string());
        }
        args.extend([
            "--nodes".to_string(),
            node.to_string(),
            "--endpoints".to_string(),
            node.to_string(),
        ]);
        args
    }

    async fn run(&self, node: &str, extra: &[&str], timeout: Duration) -> Result<String> {
        let mut args = self.node_args(node);
        args.extend(extra.iter().map(|s| s.to_string()));
        run_talosctl(&self.binary, &args, timeout).await
    }

    async fn run_insecure(&self, node: &str, extra: &[&str]) -> Result<String> {
        let mut args: Vec<String> = extra.iter().map(|s| s.to_string()).collect();
        args.extend([
            "--insecure".to_string(),
            "--nodes".to_string(),
            node.to_string(),
        ]);
        run_talosctl(&self.binary, &args, COMMAND_TIMEOUT).await
    }
}

#[async_trait]
impl TalosApi for TalosctlClient {
    async fn machine_status(&self, node: &str) -> Result<MachineStatus> {
        let query = ["get", "machinestatus", "-o", "json"];
        // Maintenance mode only answers unauthenticated requests
        let raw = match self.talosconfig {
            Some(_) => match self.run(node, &query, COMMAND_TIMEOUT).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("Authenticated machinestatus failed for {}: {}", node, e);
                    self.run_insecure(node, &query).await?
                }
            },
            None => self.run_insecure(node, &query).await?,
        };
        let mut status = parse_machine_status(&raw)?;

        if status.configured {
            let kubelet = self
                .run(node, &["get", "service", "kubelet", "-o", "json"], COMMAND_TIMEOUT)
                .await;
            status.kubelet_running = kubelet
                .ok()
                .map(|raw| parse_service_running(&raw))
                .unwrap_or(false);
        }
        Ok(status)
    }

    #[instrument(skip(self, config))]
    async fn apply_config(&self, node: &str, config: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("apply-")
            .suffix(".yaml")
            .tempfile_in(&self.scratch_dir)?;
        file.write_all(config.as_bytes())?;
        file.flush()?;
        let path = file.path().display().to_string();
        self.run_insecure(node, &["apply-config", "--file", path.as_str()])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn bootstrap(&self, node: &str) -> Result<()> {
        self.run(node, &["bootstrap"], COMMAND_TIMEOUT).await.map(|_| ())
    }

    async fn version(&self, node: &str) -> Result<String> {
        let raw = self.run(node, &["version"], COMMAND_TIMEOUT).await?;
        parse_server_version(&raw).ok_or_else(|| {
            TugboatError::TalosError(format!("{}: no server version in talosctl output", node))
        })
    }

    #[instrument(skip(self, request), fields(image = %request.image))]
    async fn upgrade(&self, node: &str, request: &UpgradeRequest) -> Result<()> {
        let image = format!("--image={}", request.image);
        let mut args = vec!["upgrade", image.as_str(), "--wait=false"];
        if request.stage {
            args.push("--stage");
        }
        if request.force {
            args.push("--force");
        }
        self.run(node, &args, COMMAND_TIMEOUT).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn upgrade_kubernetes(&self, endpoint: &str, version: &str) -> Result<()> {
        // upgrade-k8s rolls every component itself and can take a while
        self.run(endpoint, &["upgrade-k8s", "--to", version], Duration::from_secs(1800))
            .await
            .map(|_| ())
    }

    async fn node_ready(&self, node: &str) -> Result<bool> {
        Ok(self.machine_status(node).await?.ready)
    }

    async fn health_check(&self, endpoint: &str) -> Result<()> {
        let wait = format!("--wait-timeout={}s", HEALTH_TIMEOUT.as_secs());
        self.run(
            endpoint,
            &["health", wait.as_str()],
            HEALTH_TIMEOUT + Duration::from_secs(30),
        )
        .await
        .map(|_| ())
    }

    async fn kubeconfig(&self, endpoint: &str) -> Result<String> {
        let dir = tempfile::Builder::new()
            .prefix("kubeconfig-")
            .tempdir_in(&self.scratch_dir)?;
        let path = dir.path().join("kubeconfig");
        let target = path.display().to_string();
        self.run(endpoint, &["kubeconfig", "--force", target.as_str()], COMMAND_TIMEOUT)
            .await?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

async fn run_talosctl(binary: &Path, args: &[String], timeout: Duration) -> Result<String> {
    debug!("Running {} {}", binary.display(), args.join(" "));

    let output = tokio::time::timeout(
        timeout,
        Command::new(binary).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| TugboatError::Timeout(format!("talosctl {} after {:?}", args.join(" "), timeout)))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TugboatError::TalosError(format!(
            "talosctl {} failed: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// JSON patch overriding the pod CIDR, none for the Talos default
fn pod_subnet_patch(pod_subnet: &str) -> Option<String> {
    if pod_subnet == DEFAULT_POD_SUBNET {
        return None;
    }
    Some(
        serde_json::json!([{
            "op": "replace",
            "path": "/cluster/network/podSubnets",
            "value": [pod_subnet]
        }])
        .to_string(),
    )
}

/// `v1.7.6` -> `v1.7`, as expected by `gen config --talos-version`
fn minor_version(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    match parts.as_slice() {
        [major, minor, ..] => format!("{}.{}", major, minor),
        _ => version.to_string(),
    }
}

#[derive(Deserialize)]
struct MachineStatusResource {
    spec: MachineStatusSpec,
}

#[derive(Deserialize)]
struct MachineStatusSpec {
    stage: String,
    #[serde(default)]
    status: Option<MachineStatusReadiness>,
}

#[derive(Deserialize)]
struct MachineStatusReadiness {
    #[serde(default)]
    ready: bool,
}

fn parse_machine_status(raw: &str) -> Result<MachineStatus> {
    let resource: MachineStatusResource = serde_json::from_str(raw.trim())?;
    let stage = resource.spec.stage.to_ascii_lowercase();
    let maintenance = stage == "maintenance";
    let configured = matches!(
        stage.as_str(),
        "booting" | "running" | "rebooting" | "upgrading" | "shutting_down"
    );
    let ready = stage == "running" && resource.spec.status.is_some_and(|s| s.ready);

    Ok(MachineStatus {
        maintenance,
        configured,
        kubelet_running: false,
        ready,
    })
}

fn parse_service_running(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw.trim())
        .ok()
        .and_then(|v| v.pointer("/spec/running").and_then(|r| r.as_bool()))
        .unwrap_or(false)
}

/// Tag of the `Server:` section of `talosctl version`
fn parse_server_version(raw: &str) -> Option<String> {
    let server = raw.split("Server:").nth(1)?;
    server
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Tag:"))
        .map(|tag| tag.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_machine_status_maintenance() {
        let raw = r#"{"metadata":{"id":"machine"},"spec":{"stage":"maintenance","status":{"ready":false}}}"#;
        let status = parse_machine_status(raw).unwrap();
        assert!(status.maintenance);
        assert!(!status.configured);
        assert!(!status.ready);
    }

    #[test]
    fn test_parse_machine_status_running_ready() {
        let raw = r#"{"spec":{"stage":"running","status":{"ready":true,"unmetConditions":[]}}}"#;
        let status = parse_machine_status(raw).unwrap();
        assert!(!status.maintenance);
        assert!(status.configured);
        assert!(status.ready);
    }

    #[test]
    fn test_parse_machine_status_booting_not_ready() {
        let raw = r#"{"spec":{"stage":"booting"}}"#;
        let status = parse_machine_status(raw).unwrap();
        assert!(status.configured);
        assert!(!status.ready);
    }

    #[test]
    fn test_parse_service_running() {
        assert!(parse_service_running(r#"{"spec":{"running":true,"healthy":true}}"#));
        assert!(!parse_service_running(r#"{"spec":{"running":false}}"#));
        assert!(!parse_service_running("not json"));
    }

    #[test]
    fn test_parse_server_version() {
        let raw = "Client:\n\tTag:         v1.8.0\nServer:\n\tNODE:        10.0.1.2\n\tTag:         v1.7.6\n\tSHA:         abc\n";
        assert_eq!(parse_server_version(raw).as_deref(), Some("v1.7.6"));
        assert_eq!(parse_server_version("Client:\n\tTag: v1.8.0\n"), None);
    }

    #[test]
    fn test_clients_keep_their_own_talosconfig() {
        let state = tempfile::tempdir().unwrap();
        let connector = TalosctlConnector::new("talosctl".into(), state.path().to_path_buf());

        let team_a = connector
            .client("team-a", "prod", Some("team-a credentials".to_string()))
            .unwrap();
        let team_b = connector
            .client("team-b", "prod", Some("team-b credentials".to_string()))
            .unwrap();
        let team_a_again = connector
            .client("team-a", "prod", Some("rotated credentials".to_string()))
            .unwrap();

        let path_a = team_a.talosconfig_path().unwrap();
        assert!(path_a.starts_with(state.path().join("team-a").join("prod")));
        assert_eq!(std::fs::read_to_string(path_a).unwrap(), "team-a credentials");
        assert_eq!(
            std::fs::read_to_string(team_b.talosconfig_path().unwrap()).unwrap(),
            "team-b credentials"
        );
        assert_ne!(Some(path_a), team_a_again.talosconfig_path());
    }

    #[test]
    fn test_talosconfig_is_removed_with_client() {
        let state = tempfile::tempdir().unwrap();
        let connector = TalosctlConnector::new("talosctl".into(), state.path().to_path_buf());

        let client = connector
            .client("default", "prod", Some("credentials".to_string()))
            .unwrap();
        let path = client.talosconfig_path().unwrap().to_path_buf();
        assert!(path.exists());
        drop(client);
        assert!(!path.exists());

        let maintenance = connector.client("default", "prod", None).unwrap();
        assert!(maintenance.talosconfig_path().is_none());
    }

    #[test]
    fn test_pod_subnet_patch_only_when_overridden() {
        assert_eq!(pod_subnet_patch("10.244.0.0/16"), None);
        let patch: serde_json::Value =
            serde_json::from_str(&pod_subnet_patch("172.16.0.0/16").unwrap()).unwrap();
        assert_eq!(patch[0]["path"], "/cluster/network/podSubnets");
        assert_eq!(patch[0]["value"][0], "172.16.0.0/16");
    }

    #[test]
    fn test_minor_version() {
        assert_eq!(minor_version("v1.7.6"), "v1.7");
        assert_eq!(minor_version("v1"), "v1");
    }
}
