// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Workload cluster client creation and secret decoding utilities

use crate::error::{Result, TugboatError};
use k8s_openapi::ByteString;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};
use std::collections::BTreeMap;

/// Create a Kubernetes client from a kubeconfig string
pub async fn create_client_from_kubeconfig(kubeconfig: &str) -> Result<Client> {
    let kubeconfig_parsed: Kubeconfig = serde_yaml::from_str(kubeconfig)
        .map_err(|e| TugboatError::KubeconfigError(format!("Failed to parse kubeconfig: {}", e)))?;

    let client_config =
        kube::Config::from_custom_kubeconfig(kubeconfig_parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                TugboatError::KubeconfigError(format!("Failed to create config: {}", e))
            })?;

    Client::try_from(client_config)
        .map_err(|e| TugboatError::KubeconfigError(format!("Failed to create client: {}", e)))
}

/// Decode secret data into UTF-8 strings
pub fn decode_secret_data(
    secret: &str,
    data: &BTreeMap<String, ByteString>,
) -> Result<BTreeMap<String, String>> {
    data.iter()
        .map(|(key, value)| {
            String::from_utf8(value.0.clone())
                .map(|decoded| (key.clone(), decoded))
                .map_err(|e| {
                    TugboatError::KubeconfigError(format!(
                        "Failed to decode key '{}' of secret {}: {}",
                        key, secret, e
                    ))
                })
        })
        .collect()
}

pub fn encode_secret_data(data: BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    data.into_iter()
        .map(|(key, value)| (key, ByteString(value.into_bytes())))
        .collect()
}
