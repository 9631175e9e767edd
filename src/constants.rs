// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Labels put on every cloud resource Tugboat creates
pub mod labels {
    /// Name of the owning TalosCluster
    pub const CLUSTER: &str = "tugboat.geeko.me/cluster";
    /// `control-plane` or `worker`
    pub const ROLE: &str = "tugboat.geeko.me/role";
    /// Node pool the server belongs to
    pub const POOL: &str = "tugboat.geeko.me/pool";
    /// Snapshot labels used to find the Talos image
    pub const IMAGE_OS: &str = "os";
    pub const IMAGE_TALOS_VERSION: &str = "talos-version";
}

/// The operator name used as field manager
pub const OPERATOR_NAME: &str = "tugboat";

/// Finalizer guarding cloud resource teardown
pub const FINALIZER: &str = "tugboat.geeko.me/cleanup";

/// Pod CIDR Talos assigns when the machine config does not override it
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";

/// CRD polling configuration
pub mod crd {
    pub const GROUP: &str = "tugboat.geeko.me";
    pub const VERSION: &str = "v1alpha1";
    pub const KIND: &str = "TalosCluster";
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}

/// Reconcile loop timing
pub mod reconcile {
    use std::time::Duration;

    pub const PROVISIONING_REQUEUE: Duration = Duration::from_secs(10);
    pub const ERROR_BACKOFF_BASE: Duration = Duration::from_secs(5);
    pub const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(300);
    /// Upper bound of entries kept in `status.lastErrors`
    pub const MAX_LAST_ERRORS: usize = 10;
}

/// Per sub-check observation timeouts
pub mod observe {
    use std::time::Duration;

    pub const CLOUD_TIMEOUT: Duration = Duration::from_secs(15);
    pub const TALOS_TIMEOUT: Duration = Duration::from_secs(10);
    pub const KUBERNETES_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Addon installation bounds
pub mod addons {
    use std::time::Duration;

    pub const MAX_RETRIES: u32 = 3;
    pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(300);
}

/// Upgrade sequencing bounds
pub mod upgrade {
    use std::time::Duration;

    pub const READY_TIMEOUT: Duration = Duration::from_secs(600);
    pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);
    pub const HEALTH_CHECK_RETRIES: u32 = 5;
    pub const HEALTH_CHECK_DELAY: Duration = Duration::from_secs(30);
}

/// Ports exposed through the control-plane load balancer
pub mod ports {
    pub const KUBE_API: u16 = 6443;
    pub const TALOS_API: u16 = 50000;
}

/// Secrets kept next to each TalosCluster
pub mod secrets {
    /// `<cluster>-talos`: machine configs and talosconfig
    pub const TALOS_SUFFIX: &str = "-talos";
    /// `<cluster>-kubeconfig`: admin kubeconfig of the workload cluster
    pub const KUBECONFIG_SUFFIX: &str = "-kubeconfig";
    pub const KUBECONFIG_KEY: &str = "value";
    pub const CONTROL_PLANE_KEY: &str = "controlplane.yaml";
    pub const WORKER_KEY: &str = "worker.yaml";
    pub const TALOSCONFIG_KEY: &str = "talosconfig";
}
