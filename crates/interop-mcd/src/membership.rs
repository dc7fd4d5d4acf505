//! Cluster membership controller
//!
//! Reconciles SFCluster records on the primary and keeps the watch manager's
//! set of watched clusters equal to the set of records. A periodic requeue
//! brings back watchers that removed themselves after a failed re-open.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use interop_common::config::ConfigProvider;
use interop_common::crd::SFCluster;
use interop_common::{Error, Result, PRIMARY_CLUSTER_LABEL};

use crate::registry::ClusterRegistry;
use crate::store::ResourceStore;
use crate::watch_manager::WatchManager;

/// The watch manager operations membership needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterWatches: Send + Sync {
    /// Start watching a cluster
    async fn add_cluster(&self, cluster_id: &str) -> Result<()>;

    /// Stop watching a cluster
    async fn remove_cluster(&self, cluster_id: &str);

    /// Queue in-flight deletes assigned to a cluster
    async fn requeue_in_progress(&self, cluster_id: &str) -> Result<usize>;

    /// Ids of the watched clusters
    async fn watched_clusters(&self) -> Vec<String>;
}

#[async_trait]
impl ClusterWatches for WatchManager {
    async fn add_cluster(&self, cluster_id: &str) -> Result<()> {
        WatchManager::add_cluster(self, cluster_id).await
    }

    async fn remove_cluster(&self, cluster_id: &str) {
        WatchManager::remove_cluster(self, cluster_id).await
    }

    async fn requeue_in_progress(&self, cluster_id: &str) -> Result<usize> {
        WatchManager::requeue_in_progress(self, cluster_id).await
    }

    async fn watched_clusters(&self) -> Vec<String> {
        WatchManager::watched_clusters(self).await
    }
}

/// Shared state for the membership controller
pub struct MembershipContext {
    /// Watch manager
    pub watches: Arc<dyn ClusterWatches>,
    /// Resolves member cluster stores
    pub registry: Arc<dyn ClusterRegistry>,
    /// SFCluster records on the primary
    pub clusters: Arc<dyn ResourceStore<SFCluster>>,
    /// Runtime configuration
    pub config: Arc<dyn ConfigProvider>,
    /// Namespace holding the SFCluster records
    pub namespace: String,
}

/// Reconcile one SFCluster record
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<SFCluster>, ctx: Arc<MembershipContext>) -> Result<Action> {
    let cluster_id = cluster.name_any();
    sync_primary_cluster_id(&ctx).await?;

    let namespace = Some(ctx.namespace.as_str());
    let Some(current) = ctx.clusters.get(namespace, &cluster_id).await? else {
        forget(&ctx, &cluster_id).await;
        return Ok(Action::await_change());
    };

    ctx.watches.add_cluster(&cluster_id).await?;
    let queued = ctx.watches.requeue_in_progress(&cluster_id).await?;
    debug!(queued, "Requeue of in-flight deletes done");

    ensure_own_record(&ctx, &current).await?;
    prune(&ctx).await?;

    let interval = ctx.config.get_config().await.cluster_reconcile_interval();
    Ok(Action::requeue(interval))
}

/// Stop watching a cluster whose record is gone
pub async fn forget(ctx: &MembershipContext, cluster_id: &str) {
    info!(cluster = %cluster_id, "SFCluster record removed, stopping watch");
    ctx.watches.remove_cluster(cluster_id).await;
}

/// Requeue policy for membership reconciles
pub fn error_policy(cluster: Arc<SFCluster>, error: &Error, _ctx: Arc<MembershipContext>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "cluster membership reconcile failed"
    );
    crate::replicator::error_action(error)
}

/// Record the single SFCluster labelled primary as the primary cluster id
async fn sync_primary_cluster_id(ctx: &MembershipContext) -> Result<()> {
    let selector = format!("{PRIMARY_CLUSTER_LABEL}=true");
    let labelled = ctx
        .clusters
        .list(Some(ctx.namespace.as_str()), Some(&selector))
        .await?;

    match labelled.as_slice() {
        [] => Ok(()),
        [primary] => {
            let id = primary.name_any();
            let mut config = ctx.config.get_config().await;
            if config.primary_cluster_id != id {
                let previous = std::mem::replace(&mut config.primary_cluster_id, id.clone());
                ctx.config.update_config(&config).await?;
                info!(primary = %id, previous = %previous, "Updated primary cluster id");
            }
            Ok(())
        }
        many => Err(Error::validation_for(
            many.iter().map(|c| c.name_any()).collect::<Vec<_>>().join(","),
            format!(
                "{} SFCluster records carry label {PRIMARY_CLUSTER_LABEL}",
                many.len()
            ),
        )),
    }
}

/// Give a member cluster its own copy of its record when it has none
async fn ensure_own_record(ctx: &MembershipContext, record: &SFCluster) -> Result<()> {
    let cluster_id = record.name_any();
    let member = ctx.registry.get_store(&cluster_id).await?;
    let namespace = record.namespace();
    if member
        .clusters
        .get(namespace.as_deref(), &cluster_id)
        .await?
        .is_some()
    {
        return Ok(());
    }

    let copy = SFCluster {
        metadata: ObjectMeta {
            name: record.metadata.name.clone(),
            namespace: record.metadata.namespace.clone(),
            labels: record.metadata.labels.clone(),
            ..Default::default()
        },
        spec: record.spec.clone(),
        status: None,
    };
    match member.clusters.create(&copy).await {
        Ok(_) => info!(cluster = %cluster_id, "Created SFCluster record in member cluster"),
        Err(e) if e.is_conflict() => {
            debug!(cluster = %cluster_id, "SFCluster record created concurrently");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Stop watching clusters that no longer have a record
async fn prune(ctx: &MembershipContext) -> Result<()> {
    let records: HashSet<String> = ctx
        .clusters
        .list(Some(ctx.namespace.as_str()), None)
        .await?
        .iter()
        .map(|c| c.name_any())
        .collect();
    for cluster_id in ctx.watches.watched_clusters().await {
        if !records.contains(&cluster_id) {
            forget(ctx, &cluster_id).await;
        }
    }
    Ok(())
}
