//! Sister cluster watch manager
//!
//! Keeps one watcher task per sister cluster and republishes every instance,
//! binding and cluster event from those clusters onto three shared bounded
//! queues. The replicators consume the queues to reconcile the primary copy
//! of whatever changed in a sister.
//!
//! The manager is an owned object created once at startup and shared by
//! handle; there is no process-global watcher state.

mod watcher;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use interop_common::crd::{Replicated, SFCluster, SFServiceBinding, SFServiceInstance, State};
use interop_common::{Error, Result, EVENT_QUEUE_CAPACITY, MULTI_CLUSTER_WATCH_TIMEOUT_SECS};

use crate::registry::ClusterRegistry;
use crate::store::{ClusterClient, StoreObject};

pub use watcher::{ApiStreamOpener, StreamOpener, WatchStream};
use watcher::{ClusterWatcher, TypedWatch};

/// An object observed in a sister cluster
#[derive(Clone, Debug)]
pub struct SisterEvent<K> {
    /// Cluster the event came from
    pub cluster_id: String,
    /// Snapshot of the object
    pub object: K,
}

impl<K: StoreObject> SisterEvent<K> {
    /// Reference to the object, used to trigger a reconcile of the primary copy
    pub fn reference(&self) -> ObjectRef<K> {
        ObjectRef::from_obj(&self.object)
    }
}

/// Bounded queue of one kind's events with a single consumer
pub struct EventQueue<K> {
    tx: mpsc::Sender<SisterEvent<K>>,
    rx: Mutex<Option<mpsc::Receiver<SisterEvent<K>>>>,
}

impl<K> EventQueue<K> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

/// The three shared event queues
pub struct EventQueues {
    instances: EventQueue<SFServiceInstance>,
    bindings: EventQueue<SFServiceBinding>,
    clusters: EventQueue<SFCluster>,
}

impl EventQueues {
    fn new(capacity: usize) -> Self {
        Self {
            instances: EventQueue::new(capacity),
            bindings: EventQueue::new(capacity),
            clusters: EventQueue::new(capacity),
        }
    }
}

/// Kinds with a sister event queue
pub trait WatchedKind: StoreObject {
    /// The queue carrying this kind's events
    fn queue(queues: &EventQueues) -> &EventQueue<Self>;
}

impl WatchedKind for SFServiceInstance {
    fn queue(queues: &EventQueues) -> &EventQueue<Self> {
        &queues.instances
    }
}

impl WatchedKind for SFServiceBinding {
    fn queue(queues: &EventQueues) -> &EventQueue<Self> {
        &queues.bindings
    }
}

impl WatchedKind for SFCluster {
    fn queue(queues: &EventQueues) -> &EventQueue<Self> {
        &queues.clusters
    }
}

/// Stream openers for the three watched kinds of one cluster
#[derive(Clone)]
pub struct ClusterOpeners {
    /// Service instance watch
    pub instances: Arc<dyn StreamOpener<SFServiceInstance>>,
    /// Service binding watch
    pub bindings: Arc<dyn StreamOpener<SFServiceBinding>>,
    /// Cluster record watch
    pub clusters: Arc<dyn StreamOpener<SFCluster>>,
}

/// Produces the stream openers for a cluster
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Resolve credentials for `cluster_id` and prepare its watches
    async fn connect(&self, cluster_id: &str) -> Result<ClusterOpeners>;
}

/// [`ClusterConnector`] resolving clients through the cluster registry.
///
/// Instances and bindings are watched in every namespace; cluster records
/// only in the control namespace.
pub struct RegistryConnector {
    registry: Arc<dyn ClusterRegistry>,
    namespace: String,
}

impl RegistryConnector {
    /// Connector using `registry`, watching SFCluster records in `namespace`
    pub fn new(registry: Arc<dyn ClusterRegistry>, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
        }
    }
}

/// Watch APIs for one cluster: instances and bindings in every namespace,
/// cluster records in the control namespace only
fn watch_apis(
    client: Client,
    namespace: &str,
) -> (Api<SFServiceInstance>, Api<SFServiceBinding>, Api<SFCluster>) {
    (
        Api::all(client.clone()),
        Api::all(client.clone()),
        Api::namespaced(client, namespace),
    )
}

#[async_trait]
impl ClusterConnector for RegistryConnector {
    async fn connect(&self, cluster_id: &str) -> Result<ClusterOpeners> {
        let client = self.registry.get_client(cluster_id).await?;
        let timeout = MULTI_CLUSTER_WATCH_TIMEOUT_SECS;
        let (instances, bindings, clusters) = watch_apis(client, &self.namespace);
        Ok(ClusterOpeners {
            instances: Arc::new(ApiStreamOpener::new(instances, timeout)),
            bindings: Arc::new(ApiStreamOpener::new(bindings, timeout)),
            clusters: Arc::new(ApiStreamOpener::new(clusters, timeout)),
        })
    }
}

pub(crate) struct WatcherHandle {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct Watchers {
    active: HashMap<String, WatcherHandle>,
    requeued: HashSet<String>,
}

impl Watchers {
    fn remove(&mut self, cluster_id: &str) -> Option<WatcherHandle> {
        self.requeued.remove(cluster_id);
        self.active.remove(cluster_id)
    }

    /// Remove a watcher only if it is still the one registered for the cluster
    pub(crate) fn remove_generation(&mut self, cluster_id: &str, generation: u64) {
        if self.active.get(cluster_id).map(|h| h.generation) == Some(generation) {
            self.remove(cluster_id);
        }
    }
}

pub(crate) type SharedWatchers = Arc<Mutex<Watchers>>;

/// Owner of all sister cluster watchers and the shared event queues
pub struct WatchManager {
    connector: Arc<dyn ClusterConnector>,
    primary: ClusterClient,
    watchers: SharedWatchers,
    queues: EventQueues,
    root: CancellationToken,
    next_generation: AtomicU64,
}

impl WatchManager {
    /// Manager with queues of the default capacity.
    ///
    /// `primary` is used to find in-flight operations when a cluster is added.
    pub fn new(connector: Arc<dyn ClusterConnector>, primary: ClusterClient) -> Self {
        Self::with_capacity(connector, primary, EVENT_QUEUE_CAPACITY)
    }

    /// Manager with queues of `capacity` events each
    pub fn with_capacity(
        connector: Arc<dyn ClusterConnector>,
        primary: ClusterClient,
        capacity: usize,
    ) -> Self {
        Self {
            connector,
            primary,
            watchers: Arc::new(Mutex::new(Watchers::default())),
            queues: EventQueues::new(capacity),
            root: CancellationToken::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start watching `cluster_id`. A cluster that is already watched is left alone.
    ///
    /// All three streams are opened before the watcher is registered, so a
    /// failure leaves no trace of the cluster.
    pub async fn add_cluster(&self, cluster_id: &str) -> Result<()> {
        if self.root.is_cancelled() {
            return Err(Error::precondition("add_cluster", "watch manager is shut down"));
        }
        if self.watchers.lock().await.active.contains_key(cluster_id) {
            debug!(cluster = %cluster_id, "Cluster already watched");
            return Ok(());
        }

        let openers = self.connector.connect(cluster_id).await?;
        let instances = openers.instances.open().await?;
        let bindings = openers.bindings.open().await?;
        let clusters = openers.clusters.open().await?;

        let mut watchers = self.watchers.lock().await;
        if watchers.active.contains_key(cluster_id) {
            debug!(cluster = %cluster_id, "Cluster added concurrently, dropping new streams");
            return Ok(());
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.root.child_token();
        watchers.active.insert(
            cluster_id.to_string(),
            WatcherHandle {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(watchers);

        let watcher = ClusterWatcher {
            cluster_id: cluster_id.to_string(),
            generation,
            instances: TypedWatch::new(
                cluster_id,
                openers.instances,
                instances,
                self.queues.instances.tx.clone(),
            ),
            bindings: TypedWatch::new(
                cluster_id,
                openers.bindings,
                bindings,
                self.queues.bindings.tx.clone(),
            ),
            clusters: TypedWatch::new(
                cluster_id,
                openers.clusters,
                clusters,
                self.queues.clusters.tx.clone(),
            ),
            cancel,
            watchers: self.watchers.clone(),
        };
        tokio::spawn(watcher.run());

        info!(cluster = %cluster_id, "Watching cluster");
        Ok(())
    }

    /// Stop watching `cluster_id`. Returns without waiting for the watcher to exit.
    pub async fn remove_cluster(&self, cluster_id: &str) {
        if let Some(handle) = self.watchers.lock().await.remove(cluster_id) {
            handle.cancel.cancel();
            info!(cluster = %cluster_id, "Removed cluster watch");
        }
    }

    /// Take the consumer end of a kind's queue.
    ///
    /// Each queue has exactly one consumer; a second call, or a call after
    /// shutdown, fails with a precondition error.
    pub async fn get_watch_channel<K: WatchedKind>(&self) -> Result<mpsc::Receiver<SisterEvent<K>>> {
        if self.root.is_cancelled() {
            return Err(Error::precondition(
                "get_watch_channel",
                "watch manager not setup",
            ));
        }
        K::queue(&self.queues).rx.lock().await.take().ok_or_else(|| {
            Error::precondition(
                "get_watch_channel",
                format!("watch manager not setup for {}", K::plural(&())),
            )
        })
    }

    /// True while a watcher for `cluster_id` is registered
    pub async fn is_watching(&self, cluster_id: &str) -> bool {
        self.watchers.lock().await.active.contains_key(cluster_id)
    }

    /// Ids of all watched clusters, sorted
    pub async fn watched_clusters(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watchers.lock().await.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Queue the primary copies of deletes that were in flight on `cluster_id`.
    ///
    /// Runs once per watched cluster until the cluster is removed. Returns the
    /// number of objects queued.
    pub async fn requeue_in_progress(&self, cluster_id: &str) -> Result<usize> {
        {
            let watchers = self.watchers.lock().await;
            if !watchers.active.contains_key(cluster_id) {
                return Err(Error::precondition(
                    "requeue_in_progress",
                    format!("cluster {cluster_id} is not watched"),
                ));
            }
            if watchers.requeued.contains(cluster_id) {
                return Ok(0);
            }
        }

        let instances = self.primary.instances.list(None, None).await?;
        let placement: HashMap<(String, String), String> = instances
            .iter()
            .filter_map(|i| {
                i.cluster_id()
                    .map(|c| ((i.namespace().unwrap_or_default(), i.name_any()), c.to_string()))
            })
            .collect();

        let mut queued = 0;
        for instance in instances {
            if instance.cluster_id() == Some(cluster_id) && is_inflight_delete(&instance) {
                self.enqueue(&self.queues.instances, cluster_id, instance).await;
                queued += 1;
            }
        }

        let bindings = self.primary.bindings.list(None, None).await?;
        for binding in bindings {
            let key = (
                binding.namespace().unwrap_or_default(),
                binding.spec.instance_id.clone(),
            );
            if placement.get(&key).map(String::as_str) == Some(cluster_id)
                && is_inflight_delete(&binding)
            {
                self.enqueue(&self.queues.bindings, cluster_id, binding).await;
                queued += 1;
            }
        }

        let mut watchers = self.watchers.lock().await;
        if watchers.active.contains_key(cluster_id) {
            watchers.requeued.insert(cluster_id.to_string());
        }
        info!(cluster = %cluster_id, queued, "Requeued in-flight deletes");
        Ok(queued)
    }

    async fn enqueue<K: StoreObject>(&self, queue: &EventQueue<K>, cluster_id: &str, object: K) {
        let event = SisterEvent {
            cluster_id: cluster_id.to_string(),
            object,
        };
        if queue.tx.send(event).await.is_err() {
            debug!(cluster = %cluster_id, "Event queue closed, dropping requeue");
        }
    }

    /// Stop every watcher. The manager cannot be used afterwards.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let mut watchers = self.watchers.lock().await;
        watchers.active.clear();
        watchers.requeued.clear();
        info!("Watch manager shut down");
    }
}

fn is_inflight_delete<K: Replicated>(obj: &K) -> bool {
    obj.state() == State::InProgress && obj.last_operation() == State::Delete
}
