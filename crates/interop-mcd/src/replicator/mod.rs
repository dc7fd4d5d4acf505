//! Cross-cluster replicators
//!
//! Each replicator reconciles the primary copy of one kind and drives it
//! through the replication state machine:
//!
//! ```text
//!  in_queue ─┐
//!  update   ─┼─► in progress ─► succeeded
//!  delete   ─┘                └─► failed
//! ```
//!
//! A trigger state pushes the primary copy into the assigned sister cluster
//! and marks the primary `in progress`, recording the trigger in the
//! `lastOperation` label. While `in progress`, the sister's status is copied
//! back until the sister's provisioner reports a terminal state.

pub mod binding;
pub mod cluster;
pub mod instance;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info};

use interop_common::config::ConfigProvider;
use interop_common::crd::{Replicated, State};
use interop_common::kube_utils::object_key;
use interop_common::retry::{retry_on_conflict, RetryConfig};
use interop_common::{Error, Result};

use crate::registry::ClusterRegistry;
use crate::store::{create_with_status, replace_with_status, ClusterClient, ResourceStore, StoreObject};

/// Delay before a failed reconcile is retried
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Shared state for the replicators
pub struct ReplicatorContext {
    /// Stores of the primary cluster
    pub primary: ClusterClient,
    /// Resolves sister cluster stores
    pub registry: Arc<dyn ClusterRegistry>,
    /// Runtime configuration (primary cluster id)
    pub config: Arc<dyn ConfigProvider>,
    /// Namespace holding SFCluster records and the catalog
    pub namespace: String,
    /// Budget for optimistic-concurrency retries
    pub retry: RetryConfig,
}

impl ReplicatorContext {
    /// Context with the default conflict retry budget
    pub fn new(
        primary: ClusterClient,
        registry: Arc<dyn ClusterRegistry>,
        config: Arc<dyn ConfigProvider>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            registry,
            config,
            namespace: namespace.into(),
            retry: RetryConfig::conflict(),
        }
    }

    /// True when `cluster_id` is the current primary
    pub(crate) async fn is_primary(&self, cluster_id: &str) -> bool {
        self.config.get_config().await.primary_cluster_id == cluster_id
    }
}

/// Requeue policy shared by the replicators
pub fn error_policy<K: StoreObject>(obj: Arc<K>, error: &Error, _ctx: Arc<ReplicatorContext>) -> Action {
    error!(
        ?error,
        kind = %K::kind(&()),
        name = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default(),
        "replication failed"
    );
    error_action(error)
}

/// Transient failures and missing objects come back after [`ERROR_REQUEUE`].
/// Anything else needs the object or the config to change first.
pub fn error_action(error: &Error) -> Action {
    if error.is_retryable() || error.is_not_found() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// Push the primary copy into the sister: create when absent, replace when present
/// and different.
///
/// `build` produces the sister object from the primary copy and the current
/// sister copy, if any. A missing sister copy is not recreated for `delete`.
pub(crate) async fn push_to_sister<K, F>(
    sister: &dyn ResourceStore<K>,
    cluster_id: &str,
    primary: &K,
    trigger: State,
    build: F,
) -> Result<()>
where
    K: Replicated + StoreObject,
    F: Fn(&K, Option<&K>) -> K,
{
    let namespace = primary.namespace();
    let name = primary.name_any();
    match sister.get(namespace.as_deref(), &name).await? {
        None if trigger == State::Delete => {
            info!(
                cluster = %cluster_id,
                name = %name,
                state = %trigger,
                "Sister copy already gone"
            );
        }
        None => {
            create_with_status(sister, &build(primary, None)).await?;
            info!(
                cluster = %cluster_id,
                name = %name,
                state = %trigger,
                "Created sister copy"
            );
        }
        Some(existing) => {
            let updated = build(primary, Some(&existing));
            if same_content(&updated, &existing) {
                debug!(cluster = %cluster_id, name = %name, "Sister copy up to date");
                return Ok(());
            }
            replace_with_status(sister, &updated).await?;
            info!(
                cluster = %cluster_id,
                name = %name,
                state = %trigger,
                "Updated sister copy"
            );
        }
    }
    Ok(())
}

fn same_content<K: StoreObject>(a: &K, b: &K) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Move the primary copy from `trigger` to `in progress`.
///
/// Re-fetches inside the conflict retry loop; when the state no longer
/// equals `trigger` the latest copy is returned without writing.
pub(crate) async fn mark_in_progress<K>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    trigger: State,
    retry: &RetryConfig,
) -> Result<K>
where
    K: Replicated + StoreObject,
{
    let namespace = obj.namespace();
    let namespace = namespace.as_deref();
    let name = obj.name_any();
    let name = name.as_str();

    retry_on_conflict(retry, "set_in_progress", move || async move {
        let mut latest = store
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found(K::kind(&()), object_key(namespace, name)))?;

        let current = latest.state();
        if current != trigger {
            info!(
                name = %name,
                state = %trigger,
                current_state = %current,
                "State changed before in progress could be set"
            );
            return Ok(latest);
        }

        latest.set_last_operation(trigger);
        let mut written = store.replace(&latest).await?;
        written.set_state(State::InProgress);
        let written = store.replace_status(&written).await?;
        debug!(
            name = %name,
            last_operation = %trigger,
            "Set in progress"
        );
        Ok(written)
    })
    .await
}

/// Delete the sister copy, tolerating its absence
pub(crate) async fn delete_sister_copy<K: StoreObject>(
    sister: &dyn ResourceStore<K>,
    cluster_id: &str,
    obj: &K,
) -> Result<()> {
    let name = obj.name_any();
    if sister.delete(obj.namespace().as_deref(), &name).await? {
        info!(cluster = %cluster_id, name = %name, "Triggered delete of sister copy");
    } else {
        debug!(cluster = %cluster_id, name = %name, "Sister copy already deleted");
    }
    Ok(())
}
