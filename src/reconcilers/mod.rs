// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! TalosCluster reconciliation: the controller, one provisioning pass, and
//! the status transitions a pass is built from.

pub mod cluster;
pub mod provision;
pub mod status;

pub use cluster::ClusterReconciler;
pub use provision::Provisioner;
