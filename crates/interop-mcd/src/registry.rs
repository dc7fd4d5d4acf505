//! Cluster registry
//!
//! Resolves a cluster id to a client. The own cluster and the primary use
//! the in-process credentials; every other cluster is reached through the
//! kubeconfig stored in the secret its `SFCluster` record points at.
//! Clients are built on every call and never cached, so rotated
//! credentials take effect on the next reconcile.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use interop_common::config::ConfigProvider;
use interop_common::crd::SFCluster;
use interop_common::kube_utils::{client_from_kubeconfig_yaml, object_key, secret_string};
use interop_common::{Error, Result, KUBECONFIG_SECRET_KEY};

use crate::store::{ClusterClient, ResourceStore};

/// Lookup of registered clusters and the clients that reach them
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Fetch the `SFCluster` record named `cluster_id`
    async fn get_cluster(&self, cluster_id: &str) -> Result<SFCluster>;

    /// Raw client for `cluster_id`
    async fn get_client(&self, cluster_id: &str) -> Result<Client>;

    /// Typed stores for `cluster_id`
    async fn get_store(&self, cluster_id: &str) -> Result<ClusterClient>;

    /// List cluster records, optionally narrowed by a label selector
    async fn list_clusters(&self, label_selector: Option<String>) -> Result<Vec<SFCluster>>;
}

/// How a cluster is reached
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterCredentials {
    /// In-process credentials of the controller
    Ambient,
    /// Kubeconfig document read from the cluster's secret
    Kubeconfig(String),
}

/// Reads cluster records and their credential secrets from the control namespace
#[derive(Clone)]
pub struct CredentialResolver {
    own_cluster_id: String,
    namespace: String,
    config: Arc<dyn ConfigProvider>,
    clusters: Arc<dyn ResourceStore<SFCluster>>,
    secrets: Arc<dyn ResourceStore<Secret>>,
}

impl CredentialResolver {
    /// Resolver reading from `namespace`
    pub fn new(
        own_cluster_id: impl Into<String>,
        namespace: impl Into<String>,
        config: Arc<dyn ConfigProvider>,
        clusters: Arc<dyn ResourceStore<SFCluster>>,
        secrets: Arc<dyn ResourceStore<Secret>>,
    ) -> Self {
        Self {
            own_cluster_id: own_cluster_id.into(),
            namespace: namespace.into(),
            config,
            clusters,
            secrets,
        }
    }

    /// Fetch a cluster record, NotFound when absent
    pub async fn get_cluster(&self, cluster_id: &str) -> Result<SFCluster> {
        self.clusters
            .get(Some(&self.namespace), cluster_id)
            .await?
            .ok_or_else(|| Error::not_found("SFCluster", object_key(Some(&self.namespace), cluster_id)))
    }

    /// List cluster records in the control namespace
    pub async fn list_clusters(&self, label_selector: Option<&str>) -> Result<Vec<SFCluster>> {
        self.clusters.list(Some(&self.namespace), label_selector).await
    }

    /// Decide how `cluster_id` is reached
    pub async fn resolve(&self, cluster_id: &str) -> Result<ClusterCredentials> {
        if cluster_id == self.own_cluster_id {
            return Ok(ClusterCredentials::Ambient);
        }
        let primary = self.config.get_config().await.primary_cluster_id;
        if cluster_id == primary {
            return Ok(ClusterCredentials::Ambient);
        }

        let cluster = self.get_cluster(cluster_id).await?;
        let secret_name = cluster.spec.secret_ref.as_str();
        if secret_name.is_empty() {
            return Err(Error::credentials(cluster_id, "SFCluster has no secretRef"));
        }
        let secret = self
            .secrets
            .get(Some(&self.namespace), secret_name)
            .await?
            .ok_or_else(|| {
                Error::credentials(
                    cluster_id,
                    format!("secret {} not found", object_key(Some(&self.namespace), secret_name)),
                )
            })?;
        let kubeconfig = secret_string(&secret, KUBECONFIG_SECRET_KEY).ok_or_else(|| {
            Error::credentials(
                cluster_id,
                format!("secret {secret_name} has no {KUBECONFIG_SECRET_KEY} key"),
            )
        })?;
        Ok(ClusterCredentials::Kubeconfig(kubeconfig))
    }
}

/// [`ClusterRegistry`] backed by the primary cluster's API server
pub struct KubeClusterRegistry {
    ambient: Client,
    resolver: CredentialResolver,
}

impl KubeClusterRegistry {
    /// Registry using `ambient` for the own and primary clusters
    pub fn new(ambient: Client, resolver: CredentialResolver) -> Self {
        Self { ambient, resolver }
    }
}

#[async_trait]
impl ClusterRegistry for KubeClusterRegistry {
    async fn get_cluster(&self, cluster_id: &str) -> Result<SFCluster> {
        self.resolver.get_cluster(cluster_id).await
    }

    async fn get_client(&self, cluster_id: &str) -> Result<Client> {
        match self.resolver.resolve(cluster_id).await? {
            ClusterCredentials::Ambient => Ok(self.ambient.clone()),
            ClusterCredentials::Kubeconfig(yaml) => {
                debug!(cluster = %cluster_id, "Building client from kubeconfig secret");
                client_from_kubeconfig_yaml(cluster_id, &yaml).await
            }
        }
    }

    async fn get_store(&self, cluster_id: &str) -> Result<ClusterClient> {
        let client = self.get_client(cluster_id).await?;
        Ok(ClusterClient::from_client(cluster_id, client))
    }

    async fn list_clusters(&self, label_selector: Option<String>) -> Result<Vec<SFCluster>> {
        self.resolver.list_clusters(label_selector.as_deref()).await
    }
}
