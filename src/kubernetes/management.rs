// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Secrets in the management cluster and access to workload clusters.

use super::client::{create_client_from_kubeconfig, decode_secret_data, encode_secret_data};
use super::workload::{KubeWorkloadApi, WorkloadApi};
use crate::constants::OPERATOR_NAME;
use crate::error::Result;
use crate::types::{TalosCluster, TalosClusterStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        owner: Option<OwnerReference>,
    ) -> Result<()>;

    /// Write the whole status as a merge patch guarded by the resourceVersion
    /// the cluster was read at. A concurrent writer makes this fail with 409.
    async fn patch_status(&self, cluster: &TalosCluster, status: &TalosClusterStatus) -> Result<()>;

    async fn connect_workload(&self, kubeconfig: &str) -> Result<Arc<dyn WorkloadApi>>;
}

pub struct KubeManagementApi {
    client: Client,
}

impl KubeManagementApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManagementApi for KubeManagementApi {
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.get_opt(name).await? {
            Some(secret) => Ok(Some(decode_secret_data(
                name,
                &secret.data.unwrap_or_default(),
            )?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, data, owner))]
    async fn upsert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
        owner: Option<OwnerReference>,
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            OPERATOR_NAME.to_string(),
        );

        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                owner_references: owner.map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(encode_secret_data(data)),
            ..Default::default()
        };

        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!("Created secret {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let existing = secrets.get(name).await?;
                secret.metadata.resource_version = existing.metadata.resource_version;
                secrets.replace(name, &PostParams::default(), &secret).await?;
                debug!("Updated secret {}/{}", namespace, name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, cluster, status), fields(cluster = %cluster.name_any()))]
    async fn patch_status(&self, cluster: &TalosCluster, status: &TalosClusterStatus) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let clusters: Api<TalosCluster> = Api::namespaced(self.client.clone(), &namespace);
        let patch = status_patch(cluster, status);
        clusters
            .patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn connect_workload(&self, kubeconfig: &str) -> Result<Arc<dyn WorkloadApi>> {
        let client = create_client_from_kubeconfig(kubeconfig).await?;
        Ok(Arc::new(KubeWorkloadApi::new(client)))
    }
}

fn status_patch(cluster: &TalosCluster, status: &TalosClusterStatus) -> serde_json::Value {
    json!({
        "metadata": { "resourceVersion": cluster.resource_version() },
        "status": status,
    })
}
