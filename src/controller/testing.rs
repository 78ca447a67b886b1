//! In-memory fakes of the controller's collaborators

use super::{Caches, Controller, ControllerConfig, Reconciler};
use crate::allocation::census::tests::node;
use crate::crd::{Credential, Minio, MinioSpec, APP_NAME_LABEL, NODE_NAME_ANNOTATION};
use crate::domain::ports::{
    BucketOptions, ClusterClient, Endpoint, ObjectCache, ObjectKey, ObjectStore,
    ObjectStoreConnector,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodCondition, PodSpec, PodStatus, Service};
use kube::{Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Object Builders
// =============================================================================

pub fn minio(namespace: &str, name: &str, spec: MinioSpec) -> Minio {
    let mut m = Minio::new(name, spec);
    m.metadata.namespace = Some(namespace.to_string());
    m.metadata.uid = Some(format!("uid-{}", name));
    m.metadata.resource_version = Some("1".to_string());
    m
}

pub fn pod(namespace: &str, name: &str, app: Option<&str>, node: Option<&str>, ready: bool) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.metadata.namespace = Some(namespace.to_string());
    pod.metadata.resource_version = Some("1".to_string());
    if let Some(app) = app {
        pod.labels_mut().insert(APP_NAME_LABEL.to_string(), app.to_string());
    }
    if let Some(node) = node {
        pod.annotations_mut()
            .insert(NODE_NAME_ANNOTATION.to_string(), node.to_string());
        pod.spec = Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        });
    }
    set_ready(&mut pod, ready);
    pod
}

pub fn service(namespace: &str, name: &str) -> Service {
    let mut svc = Service::default();
    svc.metadata.name = Some(name.to_string());
    svc.metadata.namespace = Some(namespace.to_string());
    svc.metadata.resource_version = Some("1".to_string());
    svc
}

fn set_ready(pod: &mut Pod, ready: bool) {
    pod.status = Some(PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
}

fn bump_version<K: Resource>(obj: &mut K) {
    let next = obj
        .meta()
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    obj.meta_mut().resource_version = Some(next.to_string());
}

// =============================================================================
// Fake Cache
// =============================================================================

pub struct FakeCache<K> {
    items: RwLock<BTreeMap<ObjectKey, Arc<K>>>,
    synced: AtomicBool,
}

impl<K> Default for FakeCache<K> {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            synced: AtomicBool::new(true),
        }
    }
}

impl<K: Resource> FakeCache<K> {
    pub fn insert(&self, obj: K) {
        if let Some(key) = ObjectKey::of(&obj) {
            self.items.write().insert(key, Arc::new(obj));
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }
}

impl<K: Send + Sync> ObjectCache<K> for FakeCache<K> {
    fn list(&self) -> Vec<Arc<K>> {
        self.items.read().values().cloned().collect()
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.items
            .read()
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Fake Cluster Client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreatePod { name: String, node: String },
    CreateService(String),
    UpdateMinio(String),
    UpdateMinioStatus(String),
}

/// Records every write and reflects it into the caches like a watch would
pub struct FakeClusterClient {
    minios: Arc<FakeCache<Minio>>,
    pods: Arc<FakeCache<Pod>>,
    services: Arc<FakeCache<Service>>,
    calls: Mutex<Vec<Call>>,
    pods_ready: AtomicBool,
    fail_updates: AtomicBool,
    gone_on_update: AtomicBool,
    gone_on_status: AtomicBool,
    hidden_pods: Mutex<BTreeMap<String, Pod>>,
    hidden_services: Mutex<BTreeMap<String, Service>>,
    reveal_on_conflict: AtomicBool,
}

impl FakeClusterClient {
    pub fn set_pods_ready(&self, ready: bool) {
        self.pods_ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Make `update_minio` report the workload as deleted
    pub fn vanish_on_update(&self, gone: bool) {
        self.gone_on_update.store(gone, Ordering::SeqCst);
    }

    /// Make `update_minio_status` report the workload as deleted
    pub fn vanish_on_status(&self, gone: bool) {
        self.gone_on_status.store(gone, Ordering::SeqCst);
    }

    /// A pod that exists in the cluster but has not reached the cache
    pub fn hide_pod(&self, pod: Pod) {
        self.hidden_pods.lock().insert(pod.name_any(), pod);
    }

    /// A service that exists in the cluster but has not reached the cache
    pub fn hide_service(&self, service: Service) {
        self.hidden_services.lock().insert(service.name_any(), service);
    }

    /// Deliver a hidden object to its cache when a create collides with it
    pub fn reveal_on_conflict(&self, reveal: bool) {
        self.reveal_on_conflict.store(reveal, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn created_pods(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreatePod { name, node } => Some((name, node)),
                _ => None,
            })
            .collect()
    }

    pub fn created_services(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateService(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let ns = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let hidden = self.hidden_pods.lock().remove(&name);
        if let Some(existing) = hidden {
            if self.reveal_on_conflict.load(Ordering::SeqCst) {
                self.pods.insert(existing);
            } else {
                self.hidden_pods.lock().insert(name.clone(), existing);
            }
            return Err(Error::ResourceExists {
                kind: "Pod".into(),
                name,
            });
        }
        if self.pods.get(&ns, &name).is_some() {
            return Err(Error::ResourceExists {
                kind: "Pod".into(),
                name,
            });
        }
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        self.calls.lock().push(Call::CreatePod {
            name: name.clone(),
            node,
        });

        let mut created = pod.clone();
        created.metadata.resource_version = Some("1".to_string());
        set_ready(&mut created, self.pods_ready.load(Ordering::SeqCst));
        self.pods.insert(created.clone());
        Ok(created)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let ns = service.namespace().unwrap_or_default();
        let name = service.name_any();
        let hidden = self.hidden_services.lock().remove(&name);
        if let Some(existing) = hidden {
            if self.reveal_on_conflict.load(Ordering::SeqCst) {
                self.services.insert(existing);
            } else {
                self.hidden_services.lock().insert(name.clone(), existing);
            }
            return Err(Error::ResourceExists {
                kind: "Service".into(),
                name,
            });
        }
        if self.services.get(&ns, &name).is_some() {
            return Err(Error::ResourceExists {
                kind: "Service".into(),
                name,
            });
        }
        self.calls.lock().push(Call::CreateService(name));
        let mut created = service.clone();
        created.metadata.resource_version = Some("1".to_string());
        self.services.insert(created.clone());
        Ok(created)
    }

    async fn update_minio(&self, minio: &Minio) -> Result<Minio> {
        let name = minio.name_any();
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Conflict {
                kind: "Minio".into(),
                name,
            });
        }
        if self.gone_on_update.load(Ordering::SeqCst) {
            return Err(Error::ResourceNotFound {
                kind: "Minio".into(),
                name,
            });
        }
        let Some(current) = self.minios.get(&minio.namespace().unwrap_or_default(), &name) else {
            return Err(Error::ResourceNotFound {
                kind: "Minio".into(),
                name,
            });
        };
        self.calls.lock().push(Call::UpdateMinio(name));

        let mut updated = minio.clone();
        updated.status = current.status.clone();
        bump_version(&mut updated);
        self.minios.insert(updated.clone());
        Ok(updated)
    }

    async fn update_minio_status(&self, minio: &Minio) -> Result<Minio> {
        let name = minio.name_any();
        if self.gone_on_status.load(Ordering::SeqCst) {
            return Err(Error::ResourceNotFound {
                kind: "Minio".into(),
                name,
            });
        }
        let Some(current) = self.minios.get(&minio.namespace().unwrap_or_default(), &name) else {
            return Err(Error::ResourceNotFound {
                kind: "Minio".into(),
                name,
            });
        };
        self.calls.lock().push(Call::UpdateMinioStatus(name));

        let mut updated = (*current).clone();
        updated.status = minio.status.clone();
        bump_version(&mut updated);
        self.minios.insert(updated.clone());
        Ok(updated)
    }
}

// =============================================================================
// Fake Object Store
// =============================================================================

pub struct FakeObjectStore {
    online: AtomicBool,
    buckets: Mutex<BTreeSet<String>>,
    failing: Mutex<HashSet<String>>,
    last_options: Mutex<Option<BucketOptions>>,
}

impl FakeObjectStore {
    fn with_online(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            buckets: Mutex::new(BTreeSet::new()),
            failing: Mutex::new(HashSet::new()),
            last_options: Mutex::new(None),
        }
    }

    pub fn online() -> Self {
        Self::with_online(true)
    }

    pub fn offline() -> Self {
        Self::with_online(false)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make creation of `bucket` fail
    pub fn fail_bucket(&self, bucket: &str) {
        self.failing.lock().insert(bucket.to_string());
    }

    pub fn buckets(&self) -> Vec<String> {
        self.buckets.lock().iter().cloned().collect()
    }

    pub fn last_options(&self) -> Option<BucketOptions> {
        self.last_options.lock().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().contains(bucket))
    }

    async fn make_bucket(&self, bucket: &str, options: &BucketOptions) -> Result<()> {
        if self.failing.lock().contains(bucket) {
            return Err(Error::ObjectStore {
                endpoint: "fake".into(),
                operation: "make_bucket".into(),
                reason: "refused".into(),
            });
        }
        *self.last_options.lock() = Some(options.clone());
        self.buckets.lock().insert(bucket.to_string());
        Ok(())
    }
}

/// Hands out one fake store per endpoint
pub struct FakeConnector {
    online: AtomicBool,
    stores: Mutex<BTreeMap<String, Arc<FakeObjectStore>>>,
    endpoints: Mutex<Vec<Endpoint>>,
    last: Mutex<Option<Arc<FakeObjectStore>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            stores: Mutex::new(BTreeMap::new()),
            endpoints: Mutex::new(Vec::new()),
            last: Mutex::new(None),
        }
    }
}

impl FakeConnector {
    /// Liveness of stores handed out from now on
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().clone()
    }

    pub fn last_store(&self) -> Option<Arc<FakeObjectStore>> {
        self.last.lock().clone()
    }
}

impl ObjectStoreConnector for FakeConnector {
    fn connect(&self, endpoint: &Endpoint, _credential: &Credential) -> Result<Arc<dyn ObjectStore>> {
        self.endpoints.lock().push(endpoint.clone());
        let online = self.online.load(Ordering::SeqCst);
        let store = Arc::clone(
            self.stores
                .lock()
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(FakeObjectStore::with_online(online))),
        );
        *self.last.lock() = Some(Arc::clone(&store));
        Ok(store)
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A reconciler wired to fakes, with every cache in namespace `store`
pub struct Harness {
    pub minios: Arc<FakeCache<Minio>>,
    pub pods: Arc<FakeCache<Pod>>,
    pub services: Arc<FakeCache<Service>>,
    pub nodes: Arc<FakeCache<Node>>,
    pub client: Arc<FakeClusterClient>,
    pub connector: Arc<FakeConnector>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(ready_nodes: &[&str]) -> Self {
        let minios = Arc::new(FakeCache::default());
        let pods = Arc::new(FakeCache::default());
        let services = Arc::new(FakeCache::default());
        let nodes = Arc::new(FakeCache::default());
        for name in ready_nodes {
            nodes.insert(node(name, true));
        }

        let client = Arc::new(FakeClusterClient {
            minios: Arc::clone(&minios),
            pods: Arc::clone(&pods),
            services: Arc::clone(&services),
            calls: Mutex::new(Vec::new()),
            pods_ready: AtomicBool::new(true),
            fail_updates: AtomicBool::new(false),
            gone_on_update: AtomicBool::new(false),
            gone_on_status: AtomicBool::new(false),
            hidden_pods: Mutex::new(BTreeMap::new()),
            hidden_services: Mutex::new(BTreeMap::new()),
            reveal_on_conflict: AtomicBool::new(false),
        });
        let connector = Arc::new(FakeConnector::default());

        let caches = Caches {
            minios: minios.clone(),
            pods: pods.clone(),
            services: services.clone(),
            nodes: nodes.clone(),
        };
        let reconciler = Reconciler::new(
            caches,
            client.clone(),
            connector.clone(),
            ControllerConfig::default(),
            test_metrics(),
            CancellationToken::new(),
        );

        Self {
            minios,
            pods,
            services,
            nodes,
            client,
            connector,
            reconciler,
        }
    }

    pub fn caches(&self) -> Caches {
        Caches {
            minios: self.minios.clone(),
            pods: self.pods.clone(),
            services: self.services.clone(),
            nodes: self.nodes.clone(),
        }
    }

    /// Controller sharing this harness' fakes
    pub fn controller(&self) -> Controller {
        Controller::new(
            self.caches(),
            self.client.clone(),
            self.connector.clone(),
            ControllerConfig::default(),
            test_metrics(),
            CancellationToken::new(),
        )
    }

    pub fn add_node(&self, name: &str, ready: bool) {
        self.nodes.insert(node(name, ready));
    }

    pub fn add_minio(&self, minio: Minio) {
        self.minios.insert(minio);
    }

    /// Existing ready replica pod; the app label is the pod name minus its index
    pub fn add_pod(&self, name: &str, node: &str) {
        let app = name.rsplit_once('-').map(|(app, _)| app).unwrap_or(name);
        self.pods.insert(pod("store", name, Some(app), Some(node), true));
    }

    pub fn add_service(&self, name: &str) {
        self.services.insert(service("store", name));
    }

    pub fn minio(&self, namespace: &str, name: &str) -> Minio {
        self.minios
            .get(namespace, name)
            .map(|m| (*m).clone())
            .expect("minio in cache")
    }
}

pub fn test_metrics() -> Metrics {
    Metrics::new(&prometheus::Registry::new()).expect("metrics")
}
