//! Typed resource stores
//!
//! Replicators read and write both the primary and the sister clusters
//! through [`ResourceStore`], so the same reconcile code runs against the API
//! server and against the in-memory store used by tests.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use interop_common::crd::{SFCluster, SFPlan, SFService, SFServiceBinding, SFServiceInstance};
use interop_common::{Error, Result};

#[cfg(test)]
pub(crate) mod memory;

/// Bounds shared by every object kind the stores handle
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// CRUD access to one kind of object in one cluster.
///
/// `replace` and `replace_status` carry the object's `resourceVersion`; a
/// stale version fails with a conflict error.
#[async_trait]
pub trait ResourceStore<K: StoreObject>: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// List objects, optionally within one namespace and matching a label selector
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>>;

    /// Create an object (status is not persisted)
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec of an existing object
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource of an existing object
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// Delete an object; `false` when it was already gone
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<bool>;
}

/// Kinds that know how to build an [`Api`] for their scope
pub trait ScopedResource: StoreObject {
    /// Api for `namespace`, or across all namespaces when `None`
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_resource {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedResource for $kind {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_resource {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedResource for $kind {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_resource!(SFServiceInstance, SFServiceBinding, SFCluster, SFService, SFPlan, Secret, Pod);
cluster_resource!(Namespace, Node);

/// Page size for list calls
const LIST_PAGE_SIZE: u32 = 500;

/// [`ResourceStore`] backed by a Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Store using `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

fn object_name<K: StoreObject>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation(format!("{} without a name", K::kind(&()))))
}

#[async_trait]
impl<K: ScopedResource> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(K::api(self.client.clone(), namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), namespace);
        let mut lp = ListParams::default().limit(LIST_PAGE_SIZE);
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let mut items = Vec::new();
        loop {
            let page = api.list(&lp).await?;
            items.extend(page.items);
            match page.metadata.continue_.filter(|token| !token.is_empty()) {
                Some(token) => lp = lp.continue_token(&token),
                None => return Ok(items),
            }
        }
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        let body = serde_json::to_vec(obj)?;
        Ok(api.replace_status(&name, &PostParams::default(), body).await?)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        let api = K::api(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Typed stores for every kind the replicators touch in one cluster
#[derive(Clone)]
pub struct ClusterClient {
    /// Id of the cluster these stores talk to
    pub cluster_id: String,
    /// Service instances
    pub instances: Arc<dyn ResourceStore<SFServiceInstance>>,
    /// Service bindings
    pub bindings: Arc<dyn ResourceStore<SFServiceBinding>>,
    /// Cluster records
    pub clusters: Arc<dyn ResourceStore<SFCluster>>,
    /// Catalog services
    pub services: Arc<dyn ResourceStore<SFService>>,
    /// Catalog plans
    pub plans: Arc<dyn ResourceStore<SFPlan>>,
    /// Secrets
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    /// Namespaces
    pub namespaces: Arc<dyn ResourceStore<Namespace>>,
    /// Nodes
    pub nodes: Arc<dyn ResourceStore<Node>>,
    /// Pods
    pub pods: Arc<dyn ResourceStore<Pod>>,
}

impl ClusterClient {
    /// Stores backed by a Kubernetes client
    pub fn from_client(cluster_id: impl Into<String>, client: Client) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            instances: Arc::new(KubeStore::new(client.clone())),
            bindings: Arc::new(KubeStore::new(client.clone())),
            clusters: Arc::new(KubeStore::new(client.clone())),
            services: Arc::new(KubeStore::new(client.clone())),
            plans: Arc::new(KubeStore::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
            namespaces: Arc::new(KubeStore::new(client.clone())),
            nodes: Arc::new(KubeStore::new(client.clone())),
            pods: Arc::new(KubeStore::new(client)),
        }
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("cluster_id", &self.cluster_id)
            .finish_non_exhaustive()
    }
}

/// Write an object's metadata/spec and then its status.
///
/// The status write carries the resourceVersion returned by the first write.
pub async fn replace_with_status<K: StoreObject>(
    store: &dyn ResourceStore<K>,
    obj: &K,
) -> Result<K> {
    let written = store.replace(obj).await?;
    status_on(store, obj, written).await
}

/// Create an object and then write its status
pub async fn create_with_status<K: StoreObject>(
    store: &dyn ResourceStore<K>,
    obj: &K,
) -> Result<K> {
    let mut fresh = obj.clone();
    fresh.meta_mut().resource_version = None;
    fresh.meta_mut().uid = None;
    let written = store.create(&fresh).await?;
    status_on(store, obj, written).await
}

async fn status_on<K: StoreObject>(
    store: &dyn ResourceStore<K>,
    desired: &K,
    written: K,
) -> Result<K> {
    let mut with_status = desired.clone();
    *with_status.meta_mut() = written.meta().clone();
    store.replace_status(&with_status).await
}
