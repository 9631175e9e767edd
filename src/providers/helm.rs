// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Chart rendering through `helm template`.

use crate::error::{Result, TugboatError};
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

const RENDER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartRef {
    pub repo: String,
    pub chart: String,
    pub version: String,
    pub release: String,
    pub namespace: String,
}

/// Turns a chart plus values into plain Kubernetes objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    async fn render(&self, chart: &ChartRef, values: &serde_json::Value) -> Result<Vec<DynamicObject>>;
}

pub struct HelmRenderer {
    binary: PathBuf,
}

impl HelmRenderer {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl ManifestRenderer for HelmRenderer {
    #[instrument(skip(self, values), fields(chart = %chart.chart, version = %chart.version))]
    async fn render(&self, chart: &ChartRef, values: &serde_json::Value) -> Result<Vec<DynamicObject>> {
        let mut child = Command::new(&self.binary)
            .args([
                "template",
                chart.release.as_str(),
                chart.chart.as_str(),
                "--repo",
                chart.repo.as_str(),
                "--version",
                chart.version.as_str(),
                "--namespace",
                chart.namespace.as_str(),
                "--include-crds",
                "--values",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(serde_yaml::to_string(values)?.as_bytes()).await?;
        }

        let output = tokio::time::timeout(RENDER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| TugboatError::Timeout(format!("helm template {}", chart.chart)))??;

        if !output.status.success() {
            return Err(TugboatError::RenderError(format!(
                "helm template {} failed: {}",
                chart.chart,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let objects = parse_manifests(&String::from_utf8_lossy(&output.stdout))?;
        debug!("Rendered {} objects", objects.len());
        Ok(objects)
    }
}

/// Split a multi-document YAML stream into objects, skipping empty documents
pub fn parse_manifests(yaml: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_yaml::from_value(value)?;
        if object.types.is_none() {
            return Err(TugboatError::RenderError(format!(
                "manifest {:?} has no apiVersion/kind",
                object.metadata.name
            )));
        }
        objects.push(object);
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifests_multi_document() {
        let yaml = r#"
---
# Source: cilium/templates/serviceaccount.yaml
apiVersion: v1
kind: ServiceAccount
metadata:
  name: cilium
  namespace: kube-system
---
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: cilium
  namespace: kube-system
spec: {}
"#;
        let objects = parse_manifests(yaml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "ServiceAccount");
        assert_eq!(objects[1].types.as_ref().unwrap().api_version, "apps/v1");
        assert_eq!(objects[1].metadata.name.as_deref(), Some("cilium"));
    }

    #[test]
    fn test_parse_manifests_rejects_untyped_documents() {
        let yaml = "metadata:\n  name: nameless\n";
        assert!(parse_manifests(yaml).is_err());
    }

    #[test]
    fn test_parse_manifests_empty_stream() {
        assert!(parse_manifests("").unwrap().is_empty());
        assert!(parse_manifests("---\n---\n").unwrap().is_empty());
    }
}
