// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cluster addons installed after bootstrap, in dependency order.

pub mod builtin;
pub mod orchestrator;

use crate::error::Result;
use crate::kubernetes::WorkloadApi;
use crate::providers::ManifestRenderer;
use crate::types::{TalosCluster, TalosClusterSpec};
use async_trait::async_trait;
use kube::api::DynamicObject;

pub use builtin::builtin_addons;
pub use orchestrator::{AddonOrchestrator, AddonScope};

/// What an addon may look at while generating its manifests
pub struct AddonContext<'a> {
    pub cluster: &'a TalosCluster,
    pub hcloud_token: &'a str,
    pub renderer: &'a dyn ManifestRenderer,
}

#[async_trait]
pub trait Addon: Send + Sync {
    fn name(&self) -> &'static str;

    /// Names of addons that must be Installed first
    fn dependencies(&self) -> &[&'static str];

    fn enabled(&self, spec: &TalosClusterSpec) -> bool;

    /// Pod networking; installed in its own macro-phase before the others
    fn is_cni(&self) -> bool {
        false
    }

    /// Namespace the manifests land in; created if missing
    fn namespace(&self) -> &'static str;

    async fn manifests(&self, ctx: &AddonContext<'_>) -> Result<Vec<DynamicObject>>;

    /// True once the addon's workloads are ready
    async fn verify(&self, api: &dyn WorkloadApi) -> Result<bool>;
}
