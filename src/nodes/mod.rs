// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-node observation and phase resolution.

pub mod observer;
pub mod resolver;

pub use observer::{ClusterObserver, NodeObserver, Observation};
pub use resolver::resolve;
