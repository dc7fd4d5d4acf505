//! In-memory [`ResourceStore`] used by the replication tests.
//!
//! Mimics the API server closely enough for the replicators: resourceVersion
//! conflicts, status subresource separation, and finalizers delaying deletion.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use interop_common::{Error, Result};

use super::{ClusterClient, ResourceStore, StoreObject};

type Key = (String, String);

struct State<K> {
    objects: BTreeMap<Key, K>,
    next_version: u64,
}

/// Thread-safe in-memory object store
pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
    unavailable: AtomicBool,
    pending_conflicts: AtomicUsize,
    writes: AtomicUsize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StoreObject> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 1,
            }),
            unavailable: AtomicBool::new(false),
            pending_conflicts: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            _kind: PhantomData,
        }
    }
}

fn key_of<K: StoreObject>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn kind<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

fn already_exists(name: &str) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{name} already exists"),
        reason: "AlreadyExists".to_string(),
        code: 409,
    }))
}

fn status_of<K: StoreObject>(obj: &K) -> Option<serde_json::Value> {
    serde_json::to_value(obj)
        .ok()
        .and_then(|v| v.get("status").cloned())
}

fn with_status<K: StoreObject>(obj: &K, status: Option<serde_json::Value>) -> Result<K> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(s) => {
                map.insert("status".to_string(), s);
            }
            None => {
                map.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

impl<K: StoreObject> MemoryStore<K> {
    /// Empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert an object as-is, status included, assigning version and uid
    pub fn seed(&self, mut obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version;
        state.next_version += 1;
        obj.meta_mut().resource_version = Some(version.to_string());
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{}", obj.name_any()));
        }
        state.objects.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Current copy of an object
    pub fn fetch(&self, namespace: &str, name: &str) -> Option<K> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Make every call fail as if the API server were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes (create, replace, status, delete)
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::internal_with_context(
                "memory_store",
                "connection refused",
            ));
        }
        Ok(())
    }

    fn check_injected_conflict(&self, name: &str) -> Result<()> {
        let taken = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(Error::conflict(kind::<K>(), name));
        }
        Ok(())
    }

    fn bump(state: &mut State<K>, obj: &mut K) {
        let version = state.next_version;
        state.next_version += 1;
        obj.meta_mut().resource_version = Some(version.to_string());
    }

    fn stored_for_write(&self, state: &State<K>, obj: &K) -> Result<K> {
        let key = key_of(obj);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(kind::<K>(), format!("{}/{}", key.0, key.1)))?;
        if let Some(version) = obj.resource_version() {
            if stored.resource_version().as_deref() != Some(version.as_str()) {
                return Err(Error::conflict(kind::<K>(), format!("{}/{}", key.0, key.1)));
            }
        }
        Ok(stored)
    }
}

#[async_trait]
impl<K: StoreObject> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.check_available()?;
        Ok(self.fetch(namespace.unwrap_or_default(), name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        self.check_available()?;
        let wanted: Vec<(String, String)> = label_selector
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| want == ns))
            .filter(|(_, obj)| {
                let labels = obj.labels();
                wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.check_available()?;
        let mut created = with_status(obj, None)?;
        let mut state = self.state.lock().unwrap();
        let key = key_of(&created);
        if state.objects.contains_key(&key) {
            return Err(already_exists(&key.1));
        }
        created.meta_mut().uid = Some(format!("uid-{}", key.1));
        created.meta_mut().deletion_timestamp = None;
        Self::bump(&mut state, &mut created);
        state.objects.insert(key, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.check_available()?;
        self.check_injected_conflict(&obj.name_any())?;
        let mut state = self.state.lock().unwrap();
        let stored = self.stored_for_write(&state, obj)?;

        let mut updated = with_status(obj, status_of(&stored))?;
        updated.meta_mut().uid = stored.meta().uid.clone();
        updated.meta_mut().deletion_timestamp = stored.meta().deletion_timestamp.clone();
        Self::bump(&mut state, &mut updated);

        let key = key_of(&updated);
        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, updated.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        self.check_available()?;
        self.check_injected_conflict(&obj.name_any())?;
        let mut state = self.state.lock().unwrap();
        let stored = self.stored_for_write(&state, obj)?;

        let mut updated = with_status(&stored, status_of(obj))?;
        Self::bump(&mut state, &mut updated);
        state.objects.insert(key_of(&updated), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Ok(false);
        };
        if stored.finalizers().is_empty() {
            state.objects.remove(&key);
        } else if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
            Self::bump(&mut state, &mut stored);
            state.objects.insert(key, stored);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// In-memory stores for one cluster, with typed handles for seeding and inspection
pub struct MemoryCluster {
    pub instances: Arc<MemoryStore<interop_common::crd::SFServiceInstance>>,
    pub bindings: Arc<MemoryStore<interop_common::crd::SFServiceBinding>>,
    pub clusters: Arc<MemoryStore<interop_common::crd::SFCluster>>,
    pub services: Arc<MemoryStore<interop_common::crd::SFService>>,
    pub plans: Arc<MemoryStore<interop_common::crd::SFPlan>>,
    pub secrets: Arc<MemoryStore<k8s_openapi::api::core::v1::Secret>>,
    pub namespaces: Arc<MemoryStore<k8s_openapi::api::core::v1::Namespace>>,
    pub nodes: Arc<MemoryStore<k8s_openapi::api::core::v1::Node>>,
    pub pods: Arc<MemoryStore<k8s_openapi::api::core::v1::Pod>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            instances: MemoryStore::new(),
            bindings: MemoryStore::new(),
            clusters: MemoryStore::new(),
            services: MemoryStore::new(),
            plans: MemoryStore::new(),
            secrets: MemoryStore::new(),
            namespaces: MemoryStore::new(),
            nodes: MemoryStore::new(),
            pods: MemoryStore::new(),
        }
    }

    /// Typed client view over these stores
    pub fn client(&self, cluster_id: &str) -> ClusterClient {
        ClusterClient {
            cluster_id: cluster_id.to_string(),
            instances: self.instances.clone(),
            bindings: self.bindings.clone(),
            clusters: self.clusters.clone(),
            services: self.services.clone(),
            plans: self.plans.clone(),
            secrets: self.secrets.clone(),
            namespaces: self.namespaces.clone(),
            nodes: self.nodes.clone(),
            pods: self.pods.clone(),
        }
    }

    /// Make every store of the cluster unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.instances.set_unavailable(unavailable);
        self.bindings.set_unavailable(unavailable);
        self.clusters.set_unavailable(unavailable);
        self.services.set_unavailable(unavailable);
        self.plans.set_unavailable(unavailable);
        self.secrets.set_unavailable(unavailable);
        self.namespaces.set_unavailable(unavailable);
        self.nodes.set_unavailable(unavailable);
        self.pods.set_unavailable(unavailable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_common::crd::{SFServiceInstance, SFServiceInstanceSpec, State};
    use interop_common::crd::Replicated;

    fn instance(name: &str) -> SFServiceInstance {
        let mut i = SFServiceInstance::new(name, SFServiceInstanceSpec::default());
        i.metadata.namespace = Some("ns".to_string());
        i
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::<SFServiceInstance>::new();
        let seeded = store.seed(instance("a"));

        let mut first = seeded.clone();
        first.labels_mut().insert("x".to_string(), "1".to_string());
        store.replace(&first).await.unwrap();

        let err = store.replace(&seeded).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn replace_keeps_status_and_replace_status_keeps_spec() {
        let store = MemoryStore::<SFServiceInstance>::new();
        let mut obj = instance("a");
        obj.set_state(State::Succeeded);
        let seeded = store.seed(obj);

        let mut changed = seeded.clone();
        changed.set_state(State::Failed);
        changed.spec.plan_id = "big".to_string();
        let written = store.replace(&changed).await.unwrap();
        assert_eq!(written.state(), State::Succeeded);
        assert_eq!(written.spec.plan_id, "big");

        let mut status_only = written.clone();
        status_only.set_state(State::Failed);
        status_only.spec.plan_id = "ignored".to_string();
        let written = store.replace_status(&status_only).await.unwrap();
        assert_eq!(written.state(), State::Failed);
        assert_eq!(written.spec.plan_id, "big");
    }

    #[tokio::test]
    async fn finalizers_delay_deletion() {
        let store = MemoryStore::<SFServiceInstance>::new();
        let mut obj = instance("a");
        obj.finalizers_mut().push("broker".to_string());
        store.seed(obj);

        assert!(store.delete(Some("ns"), "a").await.unwrap());
        let pending = store.fetch("ns", "a").unwrap();
        assert!(pending.is_deleting());

        let mut released = pending.clone();
        released.finalizers_mut().clear();
        store.replace(&released).await.unwrap();
        assert!(store.fetch("ns", "a").is_none());
        assert!(!store.delete(Some("ns"), "a").await.unwrap());
    }

    #[tokio::test]
    async fn create_drops_status_and_rejects_duplicates() {
        let store = MemoryStore::<SFServiceInstance>::new();
        let mut obj = instance("a");
        obj.set_state(State::Failed);
        let created = store.create(&obj).await.unwrap();
        assert!(created.status.is_none());
        assert!(created.uid().is_some());
        assert!(store.create(&obj).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let store = MemoryStore::<SFServiceInstance>::new();
        let mut labelled = instance("a");
        labelled
            .labels_mut()
            .insert("primary".to_string(), "true".to_string());
        store.seed(labelled);
        store.seed(instance("b"));

        assert_eq!(store.list(None, None).await.unwrap().len(), 2);
        let found = store.list(Some("ns"), Some("primary=true")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
    }
}
