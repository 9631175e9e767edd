// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Installs enabled addons one at a time in dependency order.

use super::{builtin_addons, Addon, AddonContext};
use crate::constants::addons::{MAX_RETRIES, VERIFY_TIMEOUT};
use crate::error::{Result, TugboatError};
use crate::kubernetes::WorkloadApi;
use crate::retry::cancellable;
use crate::types::{AddonPhase, AddonStatus, TalosClusterSpec};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Which addons an install run covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddonScope {
    Cni,
    Other,
}

impl AddonScope {
    fn covers(self, addon: &dyn Addon) -> bool {
        match self {
            AddonScope::Cni => addon.is_cni(),
            AddonScope::Other => !addon.is_cni(),
        }
    }
}

pub struct AddonOrchestrator {
    /// Addons in install order
    addons: Vec<Arc<dyn Addon>>,
}

impl AddonOrchestrator {
    /// Order the addons by dependency. Fails on unknown dependencies or cycles.
    pub fn new(addons: Vec<Arc<dyn Addon>>) -> Result<Self> {
        let order = topological_order(&addons)?;
        let addons = order.into_iter().map(|i| Arc::clone(&addons[i])).collect();
        Ok(Self { addons })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(builtin_addons())
    }

    pub fn install_order(&self) -> Vec<&'static str> {
        self.addons.iter().map(|a| a.name()).collect()
    }

    /// Every enabled addon must have its dependencies enabled too
    pub fn validate(&self, spec: &TalosClusterSpec) -> Result<()> {
        let enabled: BTreeSet<&str> = self
            .addons
            .iter()
            .filter(|a| a.enabled(spec))
            .map(|a| a.name())
            .collect();

        for addon in self.addons.iter().filter(|a| a.enabled(spec)) {
            if let Some(missing) = addon
                .dependencies()
                .iter()
                .find(|dep| !enabled.contains(**dep))
            {
                return Err(TugboatError::ConfigError(format!(
                    "addon {} requires {} to be enabled",
                    addon.name(),
                    missing
                )));
            }
        }
        Ok(())
    }

    /// Names of the enabled addons in scope, in install order
    pub fn enabled(&self, spec: &TalosClusterSpec, scope: AddonScope) -> Vec<&'static str> {
        self.addons
            .iter()
            .filter(|a| scope.covers(a.as_ref()) && a.enabled(spec))
            .map(|a| a.name())
            .collect()
    }

    /// Run one install pass over the addons in scope, updating `statuses` in
    /// place. Returns every phase transition in the order it happened.
    ///
    /// Each pending addon gets a single apply and readiness check per pass.
    /// An addon that is not ready yet stays Installing for the next pass; one
    /// that errors, or stays unready past `VERIFY_TIMEOUT`, uses up an attempt
    /// and turns Failed after `MAX_RETRIES` attempts. Installed and Failed
    /// addons are left alone. An addon whose dependency is not Installed is
    /// skipped without a state change.
    #[instrument(skip_all, fields(scope = ?scope))]
    pub async fn install(
        &self,
        ctx: &AddonContext<'_>,
        workload: &dyn WorkloadApi,
        scope: AddonScope,
        statuses: &mut BTreeMap<String, AddonStatus>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, AddonPhase)>> {
        let spec = &ctx.cluster.spec;
        let mut transitions = Vec::new();

        for addon in self.addons.iter().filter(|a| scope.covers(a.as_ref())) {
            if !addon.enabled(spec) {
                continue;
            }
            let name = addon.name();
            let phase = statuses.get(name).map(|s| s.phase).unwrap_or_default();
            if matches!(phase, AddonPhase::Installed | AddonPhase::Failed) {
                continue;
            }

            let blocked_on = addon.dependencies().iter().find(|dep| {
                statuses.get(**dep).map(|s| s.phase) != Some(AddonPhase::Installed)
            });
            if let Some(dep) = blocked_on {
                info!("Addon {} waits for {}", name, dep);
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TugboatError::Cancelled);
            }

            let status = statuses.entry(name.to_string()).or_default();
            if status.phase != AddonPhase::Installing {
                status.phase = AddonPhase::Installing;
                status.started_at = Some(now);
                transitions.push((name.to_string(), AddonPhase::Installing));
            }

            let attempt = cancellable(self.attempt(addon.as_ref(), ctx, workload), cancel).await;
            let error = match attempt {
                Ok(true) => {
                    info!("Addon {} installed", name);
                    status.phase = AddonPhase::Installed;
                    status.installed = true;
                    status.healthy = true;
                    status.message = None;
                    status.duration_seconds = status
                        .started_at
                        .map(|started| (now - started).num_seconds());
                    transitions.push((name.to_string(), AddonPhase::Installed));
                    continue;
                }
                Ok(false) => {
                    let waited = status.started_at.map(|started| now - started);
                    if waited.map_or(true, |w| w.to_std().unwrap_or_default() < VERIFY_TIMEOUT) {
                        debug!("Addon {} not ready yet", name);
                        status.message = Some("waiting for readiness".to_string());
                        continue;
                    }
                    format!("not ready after {}s", VERIFY_TIMEOUT.as_secs())
                }
                Err(TugboatError::Cancelled) => return Err(TugboatError::Cancelled),
                Err(e) => e.to_string(),
            };

            status.retry_count += 1;
            status.message = Some(error.clone());
            if status.retry_count >= MAX_RETRIES {
                warn!("Addon {} failed after {} attempts: {}", name, status.retry_count, error);
                status.phase = AddonPhase::Failed;
                status.healthy = false;
                transitions.push((name.to_string(), AddonPhase::Failed));
            } else {
                warn!("Addon {} attempt {} failed: {}", name, status.retry_count, error);
                status.started_at = Some(now);
            }
        }

        Ok(transitions)
    }

    /// Apply the addon's objects and check readiness once
    async fn attempt(
        &self,
        addon: &dyn Addon,
        ctx: &AddonContext<'_>,
        workload: &dyn WorkloadApi,
    ) -> Result<bool> {
        let name = addon.name();
        let manifests = addon.manifests(ctx).await.map_err(|e| addon_error(name, e))?;
        workload
            .ensure_namespace(addon.namespace())
            .await
            .map_err(|e| addon_error(name, e))?;
        for object in &manifests {
            workload.apply(object).await.map_err(|e| addon_error(name, e))?;
        }
        debug!("Applied {} objects for addon {}", manifests.len(), name);

        match addon.verify(workload).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                warn!("Verifying addon {} failed: {}", name, e);
                Ok(false)
            }
        }
    }
}

fn addon_error(addon: &str, e: TugboatError) -> TugboatError {
    TugboatError::AddonError {
        addon: addon.to_string(),
        message: e.to_string(),
    }
}

/// Kahn's algorithm; among addons that are ready at the same time the one
/// declared first goes first.
fn topological_order(addons: &[Arc<dyn Addon>]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = addons
        .iter()
        .enumerate()
        .map(|(i, a)| (a.name(), i))
        .collect();

    let mut indegree = vec![0usize; addons.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); addons.len()];
    for (i, addon) in addons.iter().enumerate() {
        for dep in addon.dependencies() {
            let Some(&d) = index.get(dep) else {
                return Err(TugboatError::ConfigError(format!(
                    "addon {} depends on unknown addon {}",
                    addon.name(),
                    dep
                )));
            };
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..addons.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(addons.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() != addons.len() {
        let stuck: Vec<&str> = (0..addons.len())
            .filter(|i| indegree[*i] > 0)
            .map(|i| addons[i].name())
            .collect();
        return Err(TugboatError::ConfigError(format!(
            "addon dependency cycle between {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
