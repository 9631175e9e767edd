// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_HCLOUD_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Hetzner Cloud API token, also handed to the cloud controller addon
    pub hcloud_token: String,
    pub hcloud_endpoint: Url,
    pub talosctl_path: PathBuf,
    pub helm_path: PathBuf,
    /// Scratch directory for generated configs and talosconfig files
    pub state_dir: PathBuf,
    /// Identity used for the leader lease
    pub pod_name: String,
    pub pod_namespace: String,
    pub leader_election: bool,
    pub requeue_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let hcloud_token =
            env::var("HCLOUD_TOKEN").context("HCLOUD_TOKEN environment variable not set")?;
        if hcloud_token.trim().is_empty() {
            anyhow::bail!("HCLOUD_TOKEN environment variable is empty");
        }

        let hcloud_endpoint = env::var("HCLOUD_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_HCLOUD_ENDPOINT.to_string())
            .parse::<Url>()
            .context("HCLOUD_ENDPOINT is not a valid URL")?;

        let requeue_secs: u64 = env::var("REQUEUE_INTERVAL_SECS")
            .unwrap_or("60".to_string())
            .parse()
            .context("REQUEUE_INTERVAL_SECS must be a number of seconds")?;

        Ok(Config {
            hcloud_token,
            hcloud_endpoint,
            talosctl_path: env::var("TALOSCTL_PATH")
                .unwrap_or("talosctl".to_string())
                .into(),
            helm_path: env::var("HELM_PATH").unwrap_or("helm".to_string()).into(),
            state_dir: env::var("STATE_DIR")
                .unwrap_or("/tmp/tugboat".to_string())
                .into(),
            pod_name: env::var("POD_NAME").unwrap_or_else(|_| "tugboat-local".to_string()),
            pod_namespace: env::var("POD_NAMESPACE")
                .unwrap_or_else(|_| "tugboat-system".to_string()),
            leader_election: env::var("LEADER_ELECTION")
                .unwrap_or("true".to_string())
                .parse()
                .unwrap_or(true),
            requeue_interval: Duration::from_secs(requeue_secs),
        })
    }
}
