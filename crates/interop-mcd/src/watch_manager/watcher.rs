//! Per-cluster watcher task
//!
//! One task per sister cluster multiplexes the instance, binding and cluster
//! watch streams with the cluster's stop signal. Each stream is wrapped in a
//! [`TypedWatch`] that republishes events onto its kind's queue and re-opens
//! the stream when the server closes it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{WatchEvent, WatchParams};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use interop_common::crd::{SFCluster, SFServiceBinding, SFServiceInstance};
use interop_common::{Error, Result};

use super::{SharedWatchers, SisterEvent};
use crate::store::StoreObject;

/// Stream of raw watch events from one cluster
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Opens (and re-opens) a watch stream with fixed options
#[async_trait]
pub trait StreamOpener<K>: Send + Sync {
    /// Start a new watch
    async fn open(&self) -> Result<WatchStream<K>>;
}

/// [`StreamOpener`] watching through an [`Api`] with a server-side timeout
pub struct ApiStreamOpener<K> {
    api: Api<K>,
    timeout_secs: u32,
}

impl<K> ApiStreamOpener<K> {
    /// Watch through `api`, asking the server to end each watch after `timeout_secs`
    pub fn new(api: Api<K>, timeout_secs: u32) -> Self {
        Self { api, timeout_secs }
    }
}

#[async_trait]
impl<K: StoreObject> StreamOpener<K> for ApiStreamOpener<K> {
    async fn open(&self) -> Result<WatchStream<K>> {
        let params = WatchParams::default().timeout(self.timeout_secs);
        let stream = self.api.watch(&params, "0").await?;
        Ok(stream.map_err(Error::from).boxed())
    }
}

/// One kind's stream within a cluster watcher
pub(crate) struct TypedWatch<K> {
    cluster_id: String,
    opener: Arc<dyn StreamOpener<K>>,
    stream: WatchStream<K>,
    queue: mpsc::Sender<SisterEvent<K>>,
}

impl<K: StoreObject> TypedWatch<K> {
    pub(crate) fn new(
        cluster_id: &str,
        opener: Arc<dyn StreamOpener<K>>,
        stream: WatchStream<K>,
        queue: mpsc::Sender<SisterEvent<K>>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            opener,
            stream,
            queue,
        }
    }

    /// Process one item from the stream. Fails only when a closed stream
    /// cannot be re-opened.
    async fn handle(&mut self, item: Option<Result<WatchEvent<K>>>) -> Result<()> {
        match item {
            Some(Ok(WatchEvent::Added(obj)))
            | Some(Ok(WatchEvent::Modified(obj)))
            | Some(Ok(WatchEvent::Deleted(obj))) => {
                publish(self.queue.clone(), self.cluster_id.clone(), obj).await
            }
            Some(Ok(WatchEvent::Bookmark(_))) => {}
            Some(Ok(WatchEvent::Error(e))) => {
                warn!(
                    cluster = %self.cluster_id,
                    kind = %K::kind(&()),
                    code = e.code,
                    message = %e.message,
                    "Watch returned an error event"
                );
            }
            Some(Err(e)) => {
                warn!(
                    cluster = %self.cluster_id,
                    kind = %K::kind(&()),
                    error = %e,
                    "Watch stream error"
                );
            }
            None => {
                debug!(
                    cluster = %self.cluster_id,
                    kind = %K::kind(&()),
                    "Watch closed, re-opening"
                );
                self.stream = self.opener.open().await?;
            }
        }
        Ok(())
    }

}

/// Send one event, waiting while the queue is full.
///
/// The pending send must not borrow the [`TypedWatch`]: its stream is `Send`
/// but not `Sync`, and the watcher task has to stay `Send` to be spawned.
async fn publish<K: StoreObject>(queue: mpsc::Sender<SisterEvent<K>>, cluster_id: String, object: K) {
    let name = object.name_any();
    let event = SisterEvent {
        cluster_id: cluster_id.clone(),
        object,
    };
    if queue.send(event).await.is_err() {
        debug!(
            cluster = %cluster_id,
            kind = %K::kind(&()),
            name = %name,
            "Event queue closed, dropping event"
        );
    }
}

/// Watcher task for one sister cluster
pub(crate) struct ClusterWatcher {
    pub(crate) cluster_id: String,
    pub(crate) generation: u64,
    pub(crate) instances: TypedWatch<SFServiceInstance>,
    pub(crate) bindings: TypedWatch<SFServiceBinding>,
    pub(crate) clusters: TypedWatch<SFCluster>,
    pub(crate) cancel: CancellationToken,
    pub(crate) watchers: SharedWatchers,
}

impl ClusterWatcher {
    /// Multiplex the three streams until stopped or a re-open fails
    pub(crate) async fn run(mut self) {
        debug!(cluster = %self.cluster_id, "Cluster watcher started");
        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(cluster = %self.cluster_id, "Stopped watching cluster");
                    return;
                }
                item = self.instances.stream.next() => self.instances.handle(item).await,
                item = self.bindings.stream.next() => self.bindings.handle(item).await,
                item = self.clusters.stream.next() => self.clusters.handle(item).await,
            };

            if let Err(e) = step {
                error!(
                    cluster = %self.cluster_id,
                    error = %e,
                    "Failed to re-open watch, removing cluster"
                );
                let mut watchers = self.watchers.lock().await;
                watchers.remove_generation(&self.cluster_id, self.generation);
                return;
            }
        }
    }
}
