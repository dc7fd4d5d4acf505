//! Cluster usage collector
//!
//! Runs in every cluster against that cluster's own SFCluster record:
//! node allocatable becomes `currentCapacity`, pod requests become
//! `requests`. The cluster replicator then carries the figures to the primary.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use interop_common::crd::{
    resource_list_add, resource_list_equal, resource_list_less, ResourceList, SFCluster,
};
use interop_common::retry::{retry_on_conflict, RetryConfig};
use interop_common::Result;

use crate::store::ClusterClient;

/// Shared state for the usage collector
pub struct UsageContext {
    /// Id of the cluster this process runs in
    pub own_cluster_id: String,
    /// Stores of the cluster this process runs in
    pub local: ClusterClient,
    /// Conflict retry budget for status writes
    pub retry: RetryConfig,
}

impl UsageContext {
    /// Context with the default conflict retry budget
    pub fn new(own_cluster_id: impl Into<String>, local: ClusterClient) -> Self {
        Self {
            own_cluster_id: own_cluster_id.into(),
            local,
            retry: RetryConfig::conflict(),
        }
    }
}

/// Refresh the usage figures of the own cluster's record
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<SFCluster>, ctx: Arc<UsageContext>) -> Result<Action> {
    if cluster.name_any() != ctx.own_cluster_id {
        return Ok(Action::await_change());
    }

    let nodes = ctx.local.nodes.list(None, None).await?;
    let capacity = node_capacity(&nodes);
    let pods = ctx.local.pods.list(None, None).await?;
    let requests = pods
        .iter()
        .fold(ResourceList::new(), |mut total, pod| {
            resource_list_add(Some(&mut total), Some(&pod_requests(pod)));
            total
        });

    let namespace = cluster.namespace();
    let namespace = namespace.as_deref();
    let name = cluster.name_any();
    let name = name.as_str();
    let store = ctx.local.clusters.as_ref();
    let capacity = &capacity;
    let requests = &requests;
    let (node_count, pod_count) = (nodes.len(), pods.len());

    retry_on_conflict(&ctx.retry, "update_cluster_usage", move || async move {
        let Some(mut latest) = store.get(namespace, name).await? else {
            debug!("Cluster record gone, skipping usage update");
            return Ok(());
        };
        let status = latest.status_or_default();
        if resource_list_equal(Some(requests), status.requests.as_ref())
            && resource_list_equal(Some(capacity), status.current_capacity.as_ref())
            && resource_list_equal(
                latest.spec.total_capacity.as_ref(),
                status.total_capacity.as_ref(),
            )
        {
            return Ok(());
        }

        let total_capacity = latest.spec.total_capacity.clone();
        let status = latest.status.get_or_insert_with(Default::default);
        status.requests = Some(requests.clone());
        status.current_capacity = Some(capacity.clone());
        status.total_capacity = total_capacity;
        store.replace_status(&latest).await?;
        info!(
            nodes = node_count,
            pods = pod_count,
            "Updated cluster usage"
        );
        Ok(())
    })
    .await?;

    Ok(Action::await_change())
}

/// Sum of node allocatable
pub fn node_capacity(nodes: &[Node]) -> ResourceList {
    let mut total = ResourceList::new();
    for node in nodes {
        let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
        resource_list_add(Some(&mut total), allocatable);
    }
    total
}

/// Effective requests of one pod.
///
/// The containers' requests are summed; an init container asking for more
/// in every resource replaces the sum. Pod overhead is added unless the pod
/// requests nothing.
pub fn pod_requests(pod: &Pod) -> ResourceList {
    let Some(spec) = pod.spec.as_ref() else {
        return ResourceList::new();
    };

    let mut resources = ResourceList::new();
    for container in &spec.containers {
        let requests = container.resources.as_ref().and_then(|r| r.requests.as_ref());
        resource_list_add(Some(&mut resources), requests);
    }

    for init in spec.init_containers.iter().flatten() {
        let requests = init.resources.as_ref().and_then(|r| r.requests.as_ref());
        if let Some(requests) = requests {
            if resource_list_less(Some(&resources), Some(requests)) {
                resources = requests.clone();
            }
        }
    }

    if spec.overhead.is_some() && !resource_list_equal(Some(&resources), Some(&ResourceList::new())) {
        resource_list_add(Some(&mut resources), spec.overhead.as_ref());
    }
    resources
}
