//! SFServiceBinding replicator
//!
//! A binding follows its instance: it is replicated into whichever cluster
//! the instance was scheduled to. Once the sister's provisioner succeeds, the
//! credentials secret it generated is copied back next to the primary
//! binding, owned by it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use interop_common::crd::{Replicated, SFServiceBinding, State};
use interop_common::kube_utils::object_key;
use interop_common::{Error, Result};

use super::{delete_sister_copy, mark_in_progress, push_to_sister, ReplicatorContext};
use crate::store::{replace_with_status, ClusterClient};

/// Reconcile the primary copy of a service binding
#[instrument(
    skip(binding, ctx),
    fields(binding = %binding.name_any(), namespace = %binding.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    binding: Arc<SFServiceBinding>,
    ctx: Arc<ReplicatorContext>,
) -> Result<Action> {
    let namespace = binding.namespace();
    let instance_id = binding.spec.instance_id.as_str();
    let Some(instance) = ctx
        .primary
        .instances
        .get(namespace.as_deref(), instance_id)
        .await?
    else {
        debug!(instance = %instance_id, "Instance not found, ignoring binding");
        return Ok(Action::await_change());
    };
    let Some(cluster_id) = instance.cluster_id() else {
        debug!(instance = %instance_id, "Instance not scheduled, ignoring binding");
        return Ok(Action::await_change());
    };
    if ctx.is_primary(cluster_id).await {
        debug!(cluster = %cluster_id, "Bound instance on the primary, nothing to replicate");
        return Ok(Action::await_change());
    }

    let sister = ctx.registry.get_store(cluster_id).await?;
    let trigger = binding.state();
    if binding.is_deleting() && trigger == State::Delete {
        delete_sister_copy(sister.bindings.as_ref(), cluster_id, binding.as_ref()).await?;
    }

    let mut current = (*binding).clone();
    if matches!(trigger, State::InQueue | State::Delete) {
        push_to_sister(
            sister.bindings.as_ref(),
            cluster_id,
            &current,
            trigger,
            sister_copy,
        )
        .await?;
        current =
            mark_in_progress(ctx.primary.bindings.as_ref(), &current, trigger, &ctx.retry).await?;
    }

    if current.state() == State::InProgress {
        observe(&ctx, &sister, current).await?;
    }
    Ok(Action::await_change())
}

async fn observe(
    ctx: &ReplicatorContext,
    sister: &ClusterClient,
    primary: SFServiceBinding,
) -> Result<()> {
    let namespace = primary.namespace();
    let name = primary.name_any();
    let last_operation = primary.last_operation();

    let updated = match sister.bindings.get(namespace.as_deref(), &name).await? {
        None if primary.is_deleting() => {
            info!(
                cluster = %sister.cluster_id,
                last_operation = %last_operation,
                "Sister copy gone, marking delete succeeded"
            );
            let secret_name = primary.secret_name();
            let mut updated = primary.clone();
            updated.set_state(State::Succeeded);
            updated.set_last_operation(State::Delete);
            if let Some(status) = updated.status.as_mut() {
                status.response.secret_ref = secret_name;
            }
            updated
        }
        None => {
            warn!(
                cluster = %sister.cluster_id,
                last_operation = %last_operation,
                "Sister copy missing while in progress"
            );
            return Err(Error::not_found(
                "SFServiceBinding",
                format!("{} in cluster {}", object_key(namespace.as_deref(), &name), sister.cluster_id),
            ));
        }
        Some(replica) if matches!(replica.state(), State::InQueue | State::Delete) => {
            debug!(
                cluster = %sister.cluster_id,
                replica_state = %replica.state(),
                "Sister copy not yet picked up"
            );
            return Ok(());
        }
        Some(replica) => {
            let mut updated = primary.clone();
            updated.metadata.labels = replica.metadata.labels.clone();
            updated.metadata.annotations = replica.metadata.annotations.clone();
            updated.status = Some(replica.status.clone().unwrap_or_default());
            updated
        }
    };

    if updated.state() == State::Succeeded {
        if updated.last_operation() == State::Delete {
            delete_primary_secret(ctx, &updated).await?;
        } else {
            copy_secret(ctx, sister, &updated).await?;
        }
    }

    replace_with_status(ctx.primary.bindings.as_ref(), &updated).await?;
    info!(
        cluster = %sister.cluster_id,
        state = %updated.state(),
        last_operation = %updated.last_operation(),
        "Copied sister state to primary"
    );
    Ok(())
}

/// Sister object built from the primary copy
fn sister_copy(primary: &SFServiceBinding, existing: Option<&SFServiceBinding>) -> SFServiceBinding {
    let mut copy = existing.cloned().unwrap_or_else(|| SFServiceBinding {
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
    copy.status = primary.status.clone();
    copy
}

/// Copy the credentials secret from the sister, owned by the primary binding
async fn copy_secret(
    ctx: &ReplicatorContext,
    sister: &ClusterClient,
    binding: &SFServiceBinding,
) -> Result<()> {
    let namespace = binding.namespace();
    let secret_name = binding.secret_name();
    let source = sister
        .secrets
        .get(namespace.as_deref(), &secret_name)
        .await?
        .ok_or_else(|| {
            Error::not_found(
                "Secret",
                format!("{} in cluster {}", object_key(namespace.as_deref(), &secret_name), sister.cluster_id),
            )
        })?;
    let owner = binding.controller_owner_ref(&());

    match ctx.primary.secrets.get(namespace.as_deref(), &secret_name).await? {
        None => {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.clone()),
                    namespace: namespace.clone(),
                    owner_references: owner.map(|o| vec![o]),
                    ..Default::default()
                },
                data: source.data.clone(),
                type_: source.type_.clone(),
                ..Default::default()
            };
            ctx.primary.secrets.create(&secret).await?;
            info!(secret = %secret_name, "Copied binding secret to primary");
        }
        Some(existing) if existing.data == source.data && existing.owner_references() == owner.as_slice() => {
            debug!(secret = %secret_name, "Binding secret up to date");
        }
        Some(mut existing) => {
            existing.data = source.data.clone();
            existing.metadata.owner_references = owner.map(|o| vec![o]);
            ctx.primary.secrets.replace(&existing).await?;
            info!(secret = %secret_name, "Updated binding secret in primary");
        }
    }
    Ok(())
}

async fn delete_primary_secret(ctx: &ReplicatorContext, binding: &SFServiceBinding) -> Result<()> {
    let secret_name = binding.secret_name();
    if ctx
        .primary
        .secrets
        .delete(binding.namespace().as_deref(), &secret_name)
        .await?
    {
        info!(secret = %secret_name, "Deleted binding secret");
    } else {
        debug!(secret = %secret_name, "Binding secret already deleted");
    }
    Ok(())
}
