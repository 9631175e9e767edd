// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TugboatError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to parse kubeconfig: {0}")]
    KubeconfigError(String),

    #[error("Cloud API request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Cloud API error ({status} {code}): {message}")]
    CloudApiError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Talos API error: {0}")]
    TalosError(String),

    #[error("Manifest rendering failed: {0}")]
    RenderError(String),

    #[error("Could not observe node {node}: {message}")]
    ObservationError { node: String, message: String },

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Addon {addon} failed: {message}")]
    AddonError { addon: String, message: String },

    #[error("Upgrade aborted: {0}")]
    UpgradeAborted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Namespace creation failed: {0}")]
    NamespaceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TugboatError {
    /// Transient infrastructure errors are retried at the call site and never
    /// surfaced as terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            TugboatError::HttpError(e) => {
                e.is_timeout() || e.is_connect() || is_transient_message(&e.to_string())
            }
            TugboatError::CloudApiError { status, code, .. } => {
                *status == 429 || *status >= 500 || code == "rate_limit_exceeded"
            }
            TugboatError::Timeout(_) => true,
            TugboatError::KubeError(kube::Error::Api(resp)) => resp.code >= 500,
            TugboatError::KubeError(e) => is_transient_message(&e.to_string()),
            TugboatError::TalosError(msg) => is_transient_message(msg),
            TugboatError::IoError(e) => is_transient_message(&e.to_string()),
            _ => false,
        }
    }
}

/// Whether an error message describes a network failure worth retrying.
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "connection reset",
        "connection refused",
        "eof",
        "timeout",
        "timed out",
        "tls handshake timeout",
        "broken pipe",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

pub type Result<T> = std::result::Result<T, TugboatError>;
