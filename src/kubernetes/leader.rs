// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Leader election on a coordination.k8s.io/v1 Lease.
//!
//! Only the leader runs the controller. Updates carry the lease's
//! resourceVersion, so two replicas racing for an expired lease cannot both
//! win: the loser gets a 409 and keeps waiting.

use crate::error::Result;
use crate::retry::sleep_or_cancel;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{api::PostParams, Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "tugboat-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until this replica holds the lease
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        info!(identity = %self.identity, lease = LEASE_NAME, "Waiting for leadership...");

        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Ok(());
                }
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, error = %e, "Failed to acquire lease"),
            }
            sleep_or_cancel(RETRY_INTERVAL, cancel).await?;
        }
    }

    /// Keep renewing the lease; cancel `lost` as soon as leadership is gone.
    pub fn spawn_renewal(self: Arc<Self>, lost: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_renewal = Utc::now();
            loop {
                if sleep_or_cancel(RENEW_INTERVAL, &lost).await.is_err() {
                    return;
                }

                let now = Utc::now();
                match self.try_acquire_or_renew(now).await {
                    Ok(true) => last_renewal = now,
                    Ok(false) => {
                        warn!(identity = %self.identity, "Lost leadership");
                        lost.cancel();
                        return;
                    }
                    Err(e) => {
                        if is_expired(Some(last_renewal), LEASE_DURATION.as_secs() as i32, now) {
                            warn!(identity = %self.identity, error = %e, "Could not renew lease before it expired");
                            lost.cancel();
                            return;
                        }
                        warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                    }
                }
            }
        })
    }

    async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.lease_spec(now, now, 0)),
            };
            return match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = existing.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        let expired = is_expired(
            spec.renew_time.as_ref().map(|t| t.0),
            spec.lease_duration_seconds.unwrap_or(0),
            now,
        );

        if !held_by_us && !expired {
            return Ok(false);
        }

        let next_spec = if held_by_us {
            let acquired = spec.acquire_time.as_ref().map(|t| t.0).unwrap_or(now);
            self.lease_spec(acquired, now, spec.lease_transitions.unwrap_or(0))
        } else {
            self.lease_spec(now, now, spec.lease_transitions.unwrap_or(0) + 1)
        };

        let updated = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version: existing.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(next_spec),
        };

        match leases.replace(LEASE_NAME, &PostParams::default(), &updated).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn lease_spec(&self, acquired: DateTime<Utc>, renewed: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(acquired)),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

fn is_expired(renewed: Option<DateTime<Utc>>, duration_secs: i32, now: DateTime<Utc>) -> bool {
    match renewed {
        Some(renewed) => now > renewed + chrono::Duration::seconds(duration_secs as i64),
        None => true,
    }
}
