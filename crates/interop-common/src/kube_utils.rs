//! Kubernetes client helpers
//!
//! Building clients for sister clusters from kubeconfig secrets, and small
//! accessors used by the replicators.

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Connect timeout for API server connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for clients that also serve long-running watches.
///
/// Must exceed the server-side watch timeout, otherwise idle watches fail
/// with "body read timed out" instead of ending cleanly.
pub const WATCH_CLIENT_READ_TIMEOUT: Duration =
    Duration::from_secs(crate::MULTI_CLUSTER_WATCH_TIMEOUT_SECS as u64 + 10);

/// Create a client from the in-process (ambient) credentials
pub async fn create_ambient_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(WATCH_CLIENT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parse a kubeconfig document into a client configuration
pub async fn config_from_kubeconfig_yaml(cluster_id: &str, yaml: &str) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
        Error::credentials(cluster_id, format!("failed to parse kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::credentials(cluster_id, format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(WATCH_CLIENT_READ_TIMEOUT);
    Ok(config)
}

/// Build a client for a sister cluster from its kubeconfig document
pub async fn client_from_kubeconfig_yaml(cluster_id: &str, yaml: &str) -> Result<Client, Error> {
    let config = config_from_kubeconfig_yaml(cluster_id, yaml).await?;
    Client::try_from(config)
        .map_err(|e| Error::credentials(cluster_id, format!("failed to create client: {}", e)))
}

/// Read a UTF-8 value from a secret's data
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}

/// Build a `namespace/name` key for logs and errors
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}
