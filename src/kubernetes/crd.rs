// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! TalosCluster CRD rendering and availability checking

use crate::constants::crd::{GROUP, KIND, POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS, VERSION};
use crate::error::Result;
use crate::retry::sleep_or_cancel;
use crate::types::TalosCluster;
use kube::{discovery::Discovery, Client, CustomResourceExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The CRD manifest as YAML, for `kubectl apply`
pub fn crd_yaml() -> Result<String> {
    Ok(serde_yaml::to_string(&TalosCluster::crd())?)
}

/// Wait for the TalosCluster CRD to become available in the cluster.
/// Polls with exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_crd(client: &Client, cancel: &CancellationToken) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;

    loop {
        match check_crd_exists(client).await {
            Ok(true) => {
                info!("{} CRD ({}/{}) is available", KIND, GROUP, VERSION);
                return Ok(());
            }
            Ok(false) => {
                info!(
                    "{} CRD ({}/{}) not yet available, waiting {} seconds...",
                    KIND, GROUP, VERSION, interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for {} CRD: {}, retrying in {} seconds...",
                    KIND, e, interval
                );
            }
        }

        sleep_or_cancel(Duration::from_secs(interval), cancel).await?;

        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

async fn check_crd_exists(client: &Client) -> Result<bool> {
    let discovery = Discovery::new(client.clone())
        .filter(&[GROUP])
        .run()
        .await?;

    let exists = discovery
        .groups()
        .filter(|group| group.name() == GROUP)
        .flat_map(|group| group.recommended_resources())
        .any(|(ar, _)| ar.kind == KIND && ar.version == VERSION);
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_yaml_names_group_and_kind() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("talosclusters.tugboat.geeko.me"));
        assert!(yaml.contains("kind: TalosCluster"));
        assert!(yaml.contains("- tc"));
    }
}
