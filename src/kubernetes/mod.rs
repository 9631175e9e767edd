// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities for the management cluster, workload clusters, CRD
//! discovery and leader election.

pub mod client;
pub mod crd;
pub mod leader;
pub mod management;
pub mod workload;

pub use crd::{crd_yaml, wait_for_crd};
pub use leader::LeaderElector;
pub use management::{KubeManagementApi, ManagementApi};
pub use workload::{ClusterNode, KubeWorkloadApi, WorkloadApi};
