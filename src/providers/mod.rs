// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! External collaborators: cloud compute, Talos node management and chart
//! rendering.

pub mod hcloud;
pub mod helm;
pub mod talos;

pub use hcloud::{CloudProvider, HcloudClient};
pub use helm::{ChartRef, HelmRenderer, ManifestRenderer};
pub use talos::{TalosApi, TalosConnector, TalosctlConnector};
