//! Controller runner - builds controller futures for each replicated kind
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. Replicators are triggered both by primary watch events and
//! by the sister events republished through the watch manager.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{self, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_stream::wrappers::ReceiverStream;

use interop_common::config::{ConfigProvider, InteroperatorConfig};
use interop_common::crd::{SFCluster, SFServiceBinding, SFServiceInstance};
use interop_common::MULTI_CLUSTER_WATCH_TIMEOUT_SECS;
use interop_mcd::membership::{self, MembershipContext};
use interop_mcd::replicator::{self, binding, cluster, instance, ReplicatorContext};
use interop_mcd::usage::{self, UsageContext};
use interop_mcd::{ClusterClient, ClusterRegistry, WatchManager};

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the controllers share, built once at startup
pub struct Runtime {
    /// Client for the cluster this process runs in
    pub client: Client,
    /// Control namespace
    pub namespace: String,
    /// Id of the cluster this process runs in
    pub own_cluster_id: String,
    /// Runtime configuration
    pub config: Arc<dyn ConfigProvider>,
    /// Cluster registry
    pub registry: Arc<dyn ClusterRegistry>,
    /// Sister watch manager
    pub watch_manager: Arc<WatchManager>,
    /// Stores of the cluster this process runs in
    pub local: ClusterClient,
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(MULTI_CLUSTER_WATCH_TIMEOUT_SECS)
}

fn concurrency(workers: usize) -> ControllerConfig {
    ControllerConfig::default().concurrency(u16::try_from(workers).unwrap_or(u16::MAX))
}

/// Build the three replicator controllers.
///
/// Takes the watch manager's queues, so it can only be called once.
pub async fn build_replicators(
    rt: &Runtime,
    settings: &InteroperatorConfig,
) -> interop_common::Result<Vec<ControllerFuture>> {
    let ctx = Arc::new(ReplicatorContext::new(
        rt.local.clone(),
        rt.registry.clone(),
        rt.config.clone(),
        rt.namespace.clone(),
    ));

    let instance_events = rt
        .watch_manager
        .get_watch_channel::<SFServiceInstance>()
        .await?;
    let binding_events = rt
        .watch_manager
        .get_watch_channel::<SFServiceBinding>()
        .await?;
    let cluster_events = rt.watch_manager.get_watch_channel::<SFCluster>().await?;

    tracing::info!("- SFServiceInstance replicator");
    let instances = Controller::new(
        Api::<SFServiceInstance>::all(rt.client.clone()),
        watcher_config(),
    )
    .with_config(concurrency(settings.instance_worker_count))
    .reconcile_on(ReceiverStream::new(instance_events).map(|event| event.reference()))
    .shutdown_on_signal()
    .run(
        instance::reconcile,
        replicator::error_policy::<SFServiceInstance>,
        ctx.clone(),
    )
    .for_each(log_reconcile_result("SFServiceInstance"));

    tracing::info!("- SFServiceBinding replicator");
    let bindings = Controller::new(
        Api::<SFServiceBinding>::all(rt.client.clone()),
        watcher_config(),
    )
    .with_config(concurrency(settings.binding_worker_count))
    .reconcile_on(ReceiverStream::new(binding_events).map(|event| event.reference()))
    .shutdown_on_signal()
    .run(
        binding::reconcile,
        replicator::error_policy::<SFServiceBinding>,
        ctx.clone(),
    )
    .for_each(log_reconcile_result("SFServiceBinding"));

    tracing::info!("- SFCluster replicator");
    let clusters = Controller::new(
        Api::<SFCluster>::namespaced(rt.client.clone(), &rt.namespace),
        watcher_config(),
    )
    .reconcile_on(ReceiverStream::new(cluster_events).map(|event| event.reference()))
    .shutdown_on_signal()
    .run(
        cluster::reconcile,
        replicator::error_policy::<SFCluster>,
        ctx,
    )
    .for_each(log_reconcile_result("SFCluster"));

    Ok(vec![Box::pin(instances), Box::pin(bindings), Box::pin(clusters)])
}

/// Build the cluster membership controller
pub fn build_membership_controller(rt: &Runtime) -> Vec<ControllerFuture> {
    let ctx = Arc::new(MembershipContext {
        watches: rt.watch_manager.clone(),
        registry: rt.registry.clone(),
        clusters: rt.local.clusters.clone(),
        config: rt.config.clone(),
        namespace: rt.namespace.clone(),
    });

    tracing::info!("- Cluster membership controller");
    let for_removals = ctx.clone();
    let membership = Controller::new(
        Api::<SFCluster>::namespaced(rt.client.clone(), &rt.namespace),
        watcher_config(),
    )
    .shutdown_on_signal()
    .run(membership::reconcile, membership::error_policy, ctx)
    .for_each(move |result| {
        let ctx = for_removals.clone();
        async move {
            // deleted records never reach reconcile
            if let Err(controller::Error::ObjectNotFound(obj_ref)) = &result {
                membership::forget(&ctx, &obj_ref.name).await;
            }
            log_result("ClusterMembership", result);
        }
    });

    vec![Box::pin(membership)]
}

/// Build the usage collector for the own cluster's record.
///
/// Node changes re-trigger the own record.
pub fn build_usage_controller(rt: &Runtime) -> Vec<ControllerFuture> {
    let ctx = Arc::new(UsageContext::new(
        rt.own_cluster_id.clone(),
        rt.local.clone(),
    ));
    let own = ObjectRef::<SFCluster>::new(&rt.own_cluster_id).within(&rt.namespace);

    tracing::info!("- Cluster usage collector");
    let usage = Controller::new(
        Api::<SFCluster>::namespaced(rt.client.clone(), &rt.namespace),
        watcher_config(),
    )
    .watches(
        Api::<Node>::all(rt.client.clone()),
        watcher_config(),
        move |_node| Some(own.clone()),
    )
    .shutdown_on_signal()
    .run(usage::reconcile, usage_error_policy, ctx)
    .for_each(log_reconcile_result("ClusterUsage"));

    vec![Box::pin(usage)]
}

fn usage_error_policy(
    cluster: Arc<SFCluster>,
    error: &interop_common::Error,
    _ctx: Arc<UsageContext>,
) -> controller::Action {
    tracing::error!(
        ?error,
        cluster = %cluster.metadata.name.as_deref().unwrap_or_default(),
        "cluster usage update failed"
    );
    replicator::error_action(error)
}

fn log_result<T: std::fmt::Debug, E: std::fmt::Debug>(controller_name: &str, result: Result<T, E>) {
    match result {
        Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
        Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
    }
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        log_result(controller_name, result);
        std::future::ready(())
    }
}
