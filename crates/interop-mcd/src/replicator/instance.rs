//! SFServiceInstance replicator
//!
//! Besides the state machine, the instance replicator keeps the instance's
//! namespace and its catalog entries (SFService, SFPlan) present in the
//! sister, and removes the sister namespace once the primary one is going.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use interop_common::crd::{Replicated, SFPlan, SFService, SFServiceInstance, State};
use interop_common::kube_utils::object_key;
use interop_common::{Error, Result, PLAN_DELETE_ATTEMPTS_ANNOTATION};

use super::{delete_sister_copy, mark_in_progress, push_to_sister, ReplicatorContext};
use crate::store::{replace_with_status, ClusterClient};

/// Reconcile the primary copy of a service instance
#[instrument(
    skip(instance, ctx),
    fields(instance = %instance.name_any(), namespace = %instance.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    instance: Arc<SFServiceInstance>,
    ctx: Arc<ReplicatorContext>,
) -> Result<Action> {
    let Some(cluster_id) = instance.cluster_id() else {
        debug!("clusterId not set, ignoring");
        return Ok(Action::await_change());
    };
    if ctx.is_primary(cluster_id).await {
        debug!(cluster = %cluster_id, "Assigned to the primary, nothing to replicate");
        return Ok(Action::await_change());
    }

    let sister = ctx.registry.get_store(cluster_id).await?;
    let namespace = instance.namespace().unwrap_or_default();
    let deleting = instance.is_deleting();

    reconcile_namespace(&ctx.primary, &sister, &namespace, deleting).await?;
    let catalog = replicate_catalog(&ctx, &sister, &instance).await;

    let trigger = instance.state();
    if deleting && trigger == State::Delete {
        delete_sister_copy(sister.instances.as_ref(), cluster_id, instance.as_ref()).await?;
    }

    let mut current = (*instance).clone();
    if trigger.is_trigger() {
        push_to_sister(
            sister.instances.as_ref(),
            cluster_id,
            &current,
            trigger,
            sister_copy,
        )
        .await?;
        current = mark_in_progress(ctx.primary.instances.as_ref(), &current, trigger, &ctx.retry)
            .await?;
    }

    if current.state() == State::InProgress {
        observe(&ctx, &sister, current).await?;
    }

    // catalog failures are reported once the state machine has run
    catalog?;
    Ok(Action::await_change())
}

/// Copy the sister's view back onto the primary while the operation runs
async fn observe(
    ctx: &ReplicatorContext,
    sister: &ClusterClient,
    mut primary: SFServiceInstance,
) -> Result<()> {
    let namespace = primary.namespace();
    let name = primary.name_any();
    let last_operation = primary.last_operation();

    match sister.instances.get(namespace.as_deref(), &name).await? {
        None if last_operation == State::Delete => {
            // absence after a delete is taken as a finished deprovision
            info!(
                cluster = %sister.cluster_id,
                last_operation = %last_operation,
                "Sister copy gone, marking delete succeeded"
            );
            primary.set_state(State::Succeeded);
            ctx.primary.instances.replace_status(&primary).await?;
        }
        None => {
            warn!(
                cluster = %sister.cluster_id,
                last_operation = %last_operation,
                "Sister copy missing while in progress"
            );
            return Err(Error::not_found(
                "SFServiceInstance",
                format!("{} in cluster {}", object_key(namespace.as_deref(), &name), sister.cluster_id),
            ));
        }
        Some(replica) if replica.state().is_trigger() => {
            debug!(
                cluster = %sister.cluster_id,
                replica_state = %replica.state(),
                replica_last_operation = %replica.last_operation(),
                "Sister copy not yet picked up"
            );
        }
        Some(replica) => {
            let updated = primary_copy(&replica, &primary);
            replace_with_status(ctx.primary.instances.as_ref(), &updated).await?;
            info!(
                cluster = %sister.cluster_id,
                last_operation = %last_operation,
                replica_state = %replica.state(),
                replica_last_operation = %replica.last_operation(),
                "Copied sister state to primary"
            );
        }
    }
    Ok(())
}

/// Sister object built from the primary copy. Keeps the sister's
/// `status.resources`, which belong to the sister's provisioner.
fn sister_copy(primary: &SFServiceInstance, existing: Option<&SFServiceInstance>) -> SFServiceInstance {
    let mut copy = existing.cloned().unwrap_or_else(|| SFServiceInstance {
        metadata: ObjectMeta {
            name: primary.metadata.name.clone(),
            namespace: primary.metadata.namespace.clone(),
            ..Default::default()
        },
        spec: primary.spec.clone(),
        status: None,
    });
    copy.metadata.labels = primary.metadata.labels.clone();
    copy.metadata.annotations = primary.metadata.annotations.clone();
    copy.spec = primary.spec.clone();

    let resources = existing
        .and_then(|e| e.status.as_ref())
        .map(|s| s.resources.clone())
        .unwrap_or_default();
    let mut status = primary.status.clone().unwrap_or_default();
    status.resources = resources;
    copy.status = Some(status);
    copy
}

/// Primary object updated from the sister copy
fn primary_copy(replica: &SFServiceInstance, primary: &SFServiceInstance) -> SFServiceInstance {
    let mut copy = primary.clone();
    copy.metadata.labels = replica.metadata.labels.clone();
    copy.metadata.annotations = replica.metadata.annotations.clone();
    copy.spec = replica.spec.clone();
    copy.status = Some(replica.status.clone().unwrap_or_default());
    copy
}

/// Ensure the instance namespace exists in the sister, or delete it there
/// once the instance is being deleted and the primary namespace is gone or
/// terminating.
async fn reconcile_namespace(
    primary: &ClusterClient,
    sister: &ClusterClient,
    namespace: &str,
    deleting: bool,
) -> Result<()> {
    let source_deleting = if deleting {
        match primary.namespaces.get(None, namespace).await? {
            None => true,
            Some(ns) => ns.metadata.deletion_timestamp.is_some(),
        }
    } else {
        false
    };
    let remove = deleting && source_deleting;

    match sister.namespaces.get(None, namespace).await? {
        None if remove => {
            debug!(cluster = %sister.cluster_id, "Namespace already deleted in sister");
        }
        None => {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            sister.namespaces.create(&ns).await?;
            info!(cluster = %sister.cluster_id, "Created namespace in sister");
        }
        Some(_) if remove => match sister.namespaces.delete(None, namespace).await {
            Ok(_) => info!(cluster = %sister.cluster_id, "Triggered namespace delete in sister"),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(cluster = %sister.cluster_id, "Namespace delete already triggered in sister");
            }
            Err(e) => return Err(e),
        },
        Some(_) => {}
    }
    Ok(())
}

/// Copy the instance's SFService and SFPlan into the sister.
///
/// Every step is attempted; the last failure is returned.
async fn replicate_catalog(
    ctx: &ReplicatorContext,
    sister: &ClusterClient,
    instance: &SFServiceInstance,
) -> Result<()> {
    let ns = ctx.namespace.as_str();
    let service_id = instance.spec.service_id.as_str();
    let plan_id = instance.spec.plan_id.as_str();
    let mut last_err = None;

    let service = match replicate_service(ctx, sister, service_id).await {
        Ok(service) => Some(service),
        Err(e) => {
            warn!(
                cluster = %sister.cluster_id,
                service = %service_id,
                error = %e,
                "Failed to replicate SFService"
            );
            last_err = Some(e);
            None
        }
    };

    let plan = ctx
        .primary
        .plans
        .get(Some(ns), plan_id)
        .await
        .and_then(|p| p.ok_or_else(|| Error::not_found("SFPlan", object_key(Some(ns), plan_id))));
    let result = match plan {
        Ok(plan) => {
            if instance.is_deleting() && plan.meta().deletion_timestamp.is_some() {
                nudge_plan_deletion(ctx, plan.clone()).await;
            }
            replicate_plan(sister, &plan, service.as_ref()).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(
            cluster = %sister.cluster_id,
            plan = %plan_id,
            error = %e,
            "Failed to replicate SFPlan"
        );
        last_err = Some(e);
    }

    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Flip the delete-attempts annotation on a deleting plan.
///
/// The plan's controller does not watch instances, so each instance delete
/// touches the plan to make it re-check whether it still has instances.
async fn nudge_plan_deletion(ctx: &ReplicatorContext, mut plan: SFPlan) {
    let annotations = plan.annotations_mut();
    let next = match annotations.get(PLAN_DELETE_ATTEMPTS_ANNOTATION).map(String::as_str) {
        Some("true") => "yes",
        _ => "true",
    };
    annotations.insert(PLAN_DELETE_ATTEMPTS_ANNOTATION.to_string(), next.to_string());

    match ctx.primary.plans.replace(&plan).await {
        Ok(_) => debug!(plan = %plan.name_any(), attempts = next, "Nudged deleting SFPlan"),
        Err(e) => warn!(plan = %plan.name_any(), error = %e, "Failed to nudge deleting SFPlan"),
    }
}

/// Returns the sister's copy of the service
async fn replicate_service(
    ctx: &ReplicatorContext,
    sister: &ClusterClient,
    service_id: &str,
) -> Result<SFService> {
    let ns = ctx.namespace.as_str();
    let service = ctx
        .primary
        .services
        .get(Some(ns), service_id)
        .await?
        .ok_or_else(|| Error::not_found("SFService", object_key(Some(ns), service_id)))?;

    let written = match sister.services.get(Some(ns), service_id).await? {
        None => {
            let copy = SFService {
                metadata: ObjectMeta {
                    name: service.metadata.name.clone(),
                    namespace: service.metadata.namespace.clone(),
                    labels: service.metadata.labels.clone(),
                    ..Default::default()
                },
                spec: service.spec.clone(),
            };
            let created = sister.services.create(&copy).await?;
            info!(cluster = %sister.cluster_id, service = %service_id, "Created SFService in sister");
            created
        }
        Some(existing)
            if existing.spec == service.spec && existing.metadata.labels == service.metadata.labels =>
        {
            existing
        }
        Some(mut existing) => {
            existing.spec = service.spec.clone();
            existing.metadata.labels = service.metadata.labels.clone();
            let updated = sister.services.replace(&existing).await?;
            info!(cluster = %sister.cluster_id, service = %service_id, "Updated SFService in sister");
            updated
        }
    };
    Ok(written)
}

async fn replicate_plan(
    sister: &ClusterClient,
    plan: &SFPlan,
    sister_service: Option<&SFService>,
) -> Result<()> {
    let ns = plan.namespace();
    let name = plan.name_any();
    let owner = sister_service.and_then(|s| s.controller_owner_ref(&()));

    match sister.plans.get(ns.as_deref(), &name).await? {
        None => {
            let copy = SFPlan {
                metadata: ObjectMeta {
                    name: plan.metadata.name.clone(),
                    namespace: plan.metadata.namespace.clone(),
                    labels: plan.metadata.labels.clone(),
                    owner_references: owner.map(|o| vec![o]),
                    ..Default::default()
                },
                spec: plan.spec.clone(),
            };
            sister.plans.create(&copy).await?;
            info!(cluster = %sister.cluster_id, plan = %name, "Created SFPlan in sister");
        }
        Some(mut existing) => {
            let mut changed = existing.spec != plan.spec || existing.metadata.labels != plan.metadata.labels;
            existing.spec = plan.spec.clone();
            existing.metadata.labels = plan.metadata.labels.clone();
            if let Some(owner) = owner {
                let refs = existing.metadata.owner_references.get_or_insert_with(Vec::new);
                if !refs.iter().any(|r| r.uid == owner.uid) {
                    refs.retain(|r| r.controller != Some(true));
                    refs.push(owner);
                    changed = true;
                }
            }
            if changed {
                sister.plans.replace(&existing).await?;
                info!(cluster = %sister.cluster_id, plan = %name, "Updated SFPlan in sister");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::test_support::{Clusters, NS};
    use crate::store::ResourceStore;
    use rstest::rstest;
    use interop_common::crd::{
        SFPlanSpec, SFServiceInstanceSpec, SFServiceInstanceStatus, SFServiceSpec, Source,
        StateValue,
    };

    fn instance(state: State, cluster: &str) -> SFServiceInstance {
        let mut i = SFServiceInstance::new(
            "i1",
            SFServiceInstanceSpec {
                service_id: "svc".to_string(),
                plan_id: "plan".to_string(),
                cluster_id: Some(cluster.to_string()),
                ..Default::default()
            },
        );
        i.metadata.namespace = Some("sf-i1".to_string());
        i.set_state(state);
        i
    }

    fn seed_catalog(clusters: &Clusters) {
        clusters.primary.services.seed(SFService {
            metadata: ObjectMeta {
                name: Some("svc".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: SFServiceSpec {
                name: "postgresql".to_string(),
                id: "svc".to_string(),
                ..Default::default()
            },
        });
        clusters.primary.plans.seed(SFPlan {
            metadata: ObjectMeta {
                name: Some("plan".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: SFPlanSpec {
                name: "small".to_string(),
                id: "plan".to_string(),
                service_id: "svc".to_string(),
                ..Default::default()
            },
        });
    }

    fn seed_primary_namespace(clusters: &Clusters) {
        clusters.primary.namespaces.seed(Namespace {
            metadata: ObjectMeta {
                name: Some("sf-i1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    // ==========================================================================
    // Story Tests: Instance replication across clusters
    // ==========================================================================

    /// Story: A queued instance assigned to cluster 2 is copied there, the
    /// primary moves to in progress, and once cluster 2 reports success the
    /// primary picks up the sister's spec and status.
    #[tokio::test]
    async fn story_instance_round_trip_through_sister() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        seed_primary_namespace(&clusters);
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "2"));

        reconcile(Arc::new(primary), ctx.clone()).await.unwrap();

        let replica = clusters.sister.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(replica.state(), State::InQueue);
        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::InProgress);
        assert_eq!(primary.last_operation(), State::InQueue);
        assert!(clusters.sister.namespaces.fetch("", "sf-i1").is_some());

        // the sister's provisioner finishes the job
        let mut done = replica.clone();
        done.set_state(State::Succeeded);
        done.status.as_mut().unwrap().dashboard_url = Some("https://dash".to_string());
        clusters.sister.instances.replace_status(&done).await.unwrap();

        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        reconcile(Arc::new(primary), ctx).await.unwrap();

        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::Succeeded);
        assert_eq!(
            primary.status.unwrap().dashboard_url.as_deref(),
            Some("https://dash")
        );
        assert_eq!(primary.spec.cluster_id.as_deref(), Some("2"));
    }

    /// Story: Instances on the primary are provisioned locally, never replicated
    #[tokio::test]
    async fn story_primary_assigned_instance_is_left_alone() {
        let clusters = Clusters::new();
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "1"));

        reconcile(Arc::new(primary), ctx).await.unwrap();

        assert!(clusters.sister.instances.fetch("sf-i1", "i1").is_none());
        assert_eq!(clusters.sister.namespaces.writes(), 0);
        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::InQueue);
    }

    #[tokio::test]
    async fn unscheduled_instance_is_ignored() {
        let clusters = Clusters::new();
        let ctx = clusters.context();
        let mut obj = instance(State::InQueue, "2");
        obj.spec.cluster_id = None;
        let primary = clusters.primary.instances.seed(obj);

        reconcile(Arc::new(primary), ctx).await.unwrap();
        assert_eq!(clusters.primary.instances.writes(), 0);
    }

    /// Story: Re-delivered events for an in-progress instance cause no sister writes
    #[tokio::test]
    async fn story_redelivery_is_idempotent() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        seed_primary_namespace(&clusters);
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "2"));
        reconcile(Arc::new(primary), ctx.clone()).await.unwrap();

        let writes = (
            clusters.sister.instances.writes(),
            clusters.sister.services.writes(),
            clusters.sister.plans.writes(),
            clusters.sister.namespaces.writes(),
        );
        for _ in 0..3 {
            let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
            reconcile(Arc::new(primary), ctx.clone()).await.unwrap();
        }
        assert_eq!(
            writes,
            (
                clusters.sister.instances.writes(),
                clusters.sister.services.writes(),
                clusters.sister.plans.writes(),
                clusters.sister.namespaces.writes(),
            )
        );
    }

    /// Story: Once the primary carries the sister's terminal state, further
    /// reconciles of it write nothing on either cluster
    #[rstest]
    #[case::succeeded(State::Succeeded)]
    #[case::failed(State::Failed)]
    #[tokio::test]
    async fn story_terminal_instance_is_not_written(#[case] terminal: State) {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        seed_primary_namespace(&clusters);
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "2"));
        reconcile(Arc::new(primary), ctx.clone()).await.unwrap();

        let mut done = clusters.sister.instances.fetch("sf-i1", "i1").unwrap();
        done.set_state(terminal);
        clusters.sister.instances.replace_status(&done).await.unwrap();
        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        reconcile(Arc::new(primary), ctx.clone()).await.unwrap();

        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), terminal);
        let writes = (
            clusters.primary.instances.writes(),
            clusters.sister.instances.writes(),
            clusters.sister.services.writes(),
            clusters.sister.plans.writes(),
            clusters.sister.namespaces.writes(),
        );

        reconcile(Arc::new(primary), ctx).await.unwrap();

        assert_eq!(
            writes,
            (
                clusters.primary.instances.writes(),
                clusters.sister.instances.writes(),
                clusters.sister.services.writes(),
                clusters.sister.plans.writes(),
                clusters.sister.namespaces.writes(),
            )
        );
    }

    /// Story: An unreachable sister leaves the primary untouched
    #[tokio::test]
    async fn story_unreachable_sister_keeps_state() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        let ctx = clusters.context();
        clusters.sister.set_unavailable(true);
        let primary = clusters.primary.instances.seed(instance(State::Update, "2"));

        assert!(reconcile(Arc::new(primary), ctx).await.is_err());
        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::Update);
    }

    /// Story: Deleting an instance deletes the sister copy; once it is gone
    /// the primary is marked succeeded
    #[tokio::test]
    async fn story_delete_completes_when_sister_copy_is_gone() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        let ctx = clusters.context();
        clusters.sister.instances.seed(instance(State::Succeeded, "2"));
        let mut obj = instance(State::Delete, "2");
        obj.finalizers_mut().push("broker".to_string());
        clusters.primary.instances.seed(obj);
        clusters.primary.instances.delete(Some("sf-i1"), "i1").await.unwrap();
        let deleting = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert!(deleting.is_deleting());

        reconcile(Arc::new(deleting), ctx).await.unwrap();

        assert!(clusters.sister.instances.fetch("sf-i1", "i1").is_none());
        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::Succeeded);
        assert_eq!(primary.last_operation(), State::Delete);
    }

    #[tokio::test]
    async fn push_preserves_sister_resources() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        let ctx = clusters.context();
        let mut existing = instance(State::Succeeded, "2");
        existing.status = Some(SFServiceInstanceStatus {
            state: State::Succeeded.into(),
            resources: vec![Source {
                api_version: "v1".to_string(),
                kind: "Secret".to_string(),
                name: "creds".to_string(),
                namespace: "sf-i1".to_string(),
            }],
            ..Default::default()
        });
        clusters.sister.instances.seed(existing);
        let primary = clusters.primary.instances.seed(instance(State::Update, "2"));

        reconcile(Arc::new(primary), ctx).await.unwrap();

        let replica = clusters.sister.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(replica.state(), State::Update);
        assert_eq!(replica.status.unwrap().resources.len(), 1);
    }

    #[tokio::test]
    async fn catalog_is_copied_with_plan_owned_by_service() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "2"));

        reconcile(Arc::new(primary), ctx).await.unwrap();

        let service = clusters.sister.services.fetch(NS, "svc").unwrap();
        let plan = clusters.sister.plans.fetch(NS, "plan").unwrap();
        assert_eq!(plan.spec.name, "small");
        let owners = plan.metadata.owner_references.unwrap();
        assert_eq!(owners[0].uid, service.uid().unwrap());
        assert_eq!(owners[0].kind, "SFService");
    }

    /// Story: A missing plan does not block replication but fails the reconcile
    #[tokio::test]
    async fn story_catalog_failure_is_reported_after_state_machine() {
        let clusters = Clusters::new();
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "2"));

        let err = reconcile(Arc::new(primary), ctx).await.unwrap_err();
        assert!(err.is_not_found());

        assert!(clusters.sister.instances.fetch("sf-i1", "i1").is_some());
        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::InProgress);
    }

    /// Story: Deleting an instance of a plan that is itself being deleted
    /// touches the plan each time, so the plan's controller re-checks it
    #[tokio::test]
    async fn story_instance_delete_nudges_deleting_plan() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        let mut plan = clusters.primary.plans.fetch(NS, "plan").unwrap();
        plan.finalizers_mut().push("offboarding".to_string());
        clusters.primary.plans.replace(&plan).await.unwrap();
        clusters.primary.plans.delete(Some(NS), "plan").await.unwrap();
        let ctx = clusters.context();

        let mut obj = instance(State::Delete, "2");
        obj.finalizers_mut().push("broker".to_string());
        clusters.primary.instances.seed(obj);
        clusters.primary.instances.delete(Some("sf-i1"), "i1").await.unwrap();

        let attempts = |clusters: &Clusters| {
            clusters
                .primary
                .plans
                .fetch(NS, "plan")
                .unwrap()
                .annotations()
                .get(PLAN_DELETE_ATTEMPTS_ANNOTATION)
                .cloned()
        };

        let deleting = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        reconcile(Arc::new(deleting), ctx.clone()).await.unwrap();
        assert_eq!(attempts(&clusters).as_deref(), Some("true"));

        let deleting = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(attempts(&clusters).as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn live_plan_is_not_touched_by_instance_delete() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        let ctx = clusters.context();
        let mut obj = instance(State::Delete, "2");
        obj.finalizers_mut().push("broker".to_string());
        clusters.primary.instances.seed(obj);
        clusters.primary.instances.delete(Some("sf-i1"), "i1").await.unwrap();
        let plan_writes = clusters.primary.plans.writes();

        let deleting = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(clusters.primary.plans.writes(), plan_writes);
    }

    /// Story: A state the controller does not know is copied back verbatim
    #[tokio::test]
    async fn story_unrecognized_sister_state_is_copied_verbatim() {
        let clusters = Clusters::new();
        seed_catalog(&clusters);
        seed_primary_namespace(&clusters);
        let ctx = clusters.context();
        let primary = clusters.primary.instances.seed(instance(State::InQueue, "2"));
        reconcile(Arc::new(primary), ctx.clone()).await.unwrap();

        let mut replica = clusters.sister.instances.fetch("sf-i1", "i1").unwrap();
        let raw: StateValue = serde_json::from_str("\"deprovisioning\"").unwrap();
        replica.status.as_mut().unwrap().state = raw;
        clusters.sister.instances.replace_status(&replica).await.unwrap();

        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        reconcile(Arc::new(primary), ctx).await.unwrap();

        let primary = clusters.primary.instances.fetch("sf-i1", "i1").unwrap();
        assert_eq!(primary.state(), State::Unknown);
        assert_eq!(primary.status.unwrap().state.as_str(), "deprovisioning");
    }

    #[tokio::test]
    async fn sister_namespace_removed_when_primary_namespace_is_gone() {
        let clusters = Clusters::new();
        clusters.sister.namespaces.seed(Namespace {
            metadata: ObjectMeta {
                name: Some("sf-i1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let primary = clusters.primary.client("1");
        let sister = clusters.sister.client("2");

        reconcile_namespace(&primary, &sister, "sf-i1", true).await.unwrap();
        assert!(clusters.sister.namespaces.fetch("", "sf-i1").is_none());
    }

    #[tokio::test]
    async fn sister_namespace_kept_while_primary_namespace_lives() {
        let clusters = Clusters::new();
        seed_primary_namespace(&clusters);
        let primary = clusters.primary.client("1");
        let sister = clusters.sister.client("2");

        reconcile_namespace(&primary, &sister, "sf-i1", true).await.unwrap();
        assert!(clusters.sister.namespaces.fetch("", "sf-i1").is_some());
    }
}
