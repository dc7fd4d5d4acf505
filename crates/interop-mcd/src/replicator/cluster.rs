//! SFCluster replicator
//!
//! The primary owns a cluster's spec, the cluster itself owns its status.
//! Spec fields are pushed to the sister's record of itself; the usage
//! figures the sister computed are pulled back into the primary's record.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use interop_common::crd::{resource_list_equal, SFCluster};
use interop_common::kube_utils::object_key;
use interop_common::retry::retry_on_conflict;
use interop_common::{Error, Result};

use super::ReplicatorContext;
use crate::store::ClusterClient;

/// Reconcile the primary copy of an SFCluster record
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<SFCluster>, ctx: Arc<ReplicatorContext>) -> Result<Action> {
    let cluster_id = cluster.name_any();
    if ctx.is_primary(&cluster_id).await {
        debug!("Primary cluster record, nothing to replicate");
        return Ok(Action::await_change());
    }

    let sister = ctx.registry.get_store(&cluster_id).await?;
    let namespace = cluster.namespace();
    if sister
        .clusters
        .get(namespace.as_deref(), &cluster_id)
        .await?
        .is_none()
    {
        debug!("Sister has no record of itself yet");
        return Ok(Action::await_change());
    }

    push_spec(&ctx, &sister, &cluster).await?;
    pull_status(&ctx, &sister, &cluster).await?;
    Ok(Action::await_change())
}

fn spec_matches(a: &SFCluster, b: &SFCluster) -> bool {
    a.spec.scheduling_limit_percentage == b.spec.scheduling_limit_percentage
        && a.spec.secret_ref == b.spec.secret_ref
        && resource_list_equal(a.spec.total_capacity.as_ref(), b.spec.total_capacity.as_ref())
}

fn status_matches(a: &SFCluster, b: &SFCluster) -> bool {
    let (a, b) = (a.status_or_default(), b.status_or_default());
    resource_list_equal(a.current_capacity.as_ref(), b.current_capacity.as_ref())
        && resource_list_equal(a.total_capacity.as_ref(), b.total_capacity.as_ref())
        && resource_list_equal(a.requests.as_ref(), b.requests.as_ref())
}

/// Copy the spec fields the primary owns onto the sister's record
async fn push_spec(ctx: &ReplicatorContext, sister: &ClusterClient, primary: &SFCluster) -> Result<()> {
    let namespace = primary.namespace();
    let namespace = namespace.as_deref();
    let name = primary.name_any();
    let name = name.as_str();
    let store = sister.clusters.as_ref();
    let cluster_id = sister.cluster_id.as_str();

    retry_on_conflict(&ctx.retry, "push_cluster_spec", move || async move {
        let mut replica = store
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found("SFCluster", object_key(namespace, name)))?;
        if spec_matches(&replica, primary) {
            return Ok(());
        }
        replica.spec.scheduling_limit_percentage = primary.spec.scheduling_limit_percentage;
        replica.spec.total_capacity = primary.spec.total_capacity.clone();
        replica.spec.secret_ref = primary.spec.secret_ref.clone();
        store.replace(&replica).await?;
        info!(cluster = %cluster_id, "Pushed cluster spec to sister");
        Ok(())
    })
    .await
}

/// Copy the usage figures the sister reported onto the primary's record
async fn pull_status(ctx: &ReplicatorContext, sister: &ClusterClient, primary: &SFCluster) -> Result<()> {
    let namespace = primary.namespace();
    let namespace = namespace.as_deref();
    let name = primary.name_any();
    let name = name.as_str();
    let sister_store = sister.clusters.as_ref();
    let primary_store = ctx.primary.clusters.as_ref();
    let cluster_id = sister.cluster_id.as_str();

    retry_on_conflict(&ctx.retry, "pull_cluster_status", move || async move {
        let replica = sister_store
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found("SFCluster", object_key(namespace, name)))?;
        let mut latest = primary_store
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found("SFCluster", object_key(namespace, name)))?;
        if status_matches(&replica, &latest) {
            return Ok(());
        }
        let reported = replica.status_or_default();
        let status = latest.status.get_or_insert_with(Default::default);
        status.current_capacity = reported.current_capacity;
        status.total_capacity = reported.total_capacity;
        status.requests = reported.requests;
        primary_store.replace_status(&latest).await?;
        info!(cluster = %cluster_id, "Pulled cluster status from sister");
        Ok(())
    })
    .await
}
