//! Domain Ports - Core trait definitions for the MinIO operator
//!
//! These traits define the boundaries between the reconcile engine and the
//! systems it talks to: the cluster caches, the cluster write API and the
//! object store served by the workload itself. Adapters implement these
//! traits to provide concrete functionality.

use crate::crd::{Credential, Minio};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Object Key
// =============================================================================

/// Identity of a namespaced object: `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any named kube object; `None` when the object has no name.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        Some(Self::new(obj.namespace().unwrap_or_default(), name))
    }

    /// Parse a `namespace/name` or bare `name` key
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::new("", name)),
            (Some(ns), Some(name), None) if !name.is_empty() => Ok(Self::new(ns, name)),
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

// =============================================================================
// Object Cache Port
// =============================================================================

/// Read-through, eventually consistent view of one kind of cluster object
pub trait ObjectCache<K>: Send + Sync {
    /// All objects currently known
    fn list(&self) -> Vec<Arc<K>>;

    /// Lookup by identity
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// Whether the initial listing has been observed
    fn has_synced(&self) -> bool;
}

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Port for cluster write operations.
///
/// Implementations return `Error::ResourceNotFound`, `Error::ResourceExists`
/// and `Error::Conflict` for the corresponding API outcomes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Create a service
    async fn create_service(&self, service: &Service) -> Result<Service>;

    /// Replace the Minio object (metadata and spec)
    async fn update_minio(&self, minio: &Minio) -> Result<Minio>;

    /// Replace the Minio status subresource
    async fn update_minio_status(&self, minio: &Minio) -> Result<Minio>;
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Options used when creating a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOptions {
    /// Region the bucket is created in
    pub region: String,
    /// Request object locking; unsupported without erasure coding
    pub object_locking: bool,
}

/// Network location of an object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: i32,
    pub secure: bool,
}

impl Endpoint {
    /// Base URL of the endpoint
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Port for the object store served by a workload
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the server answers its liveness check
    async fn is_online(&self) -> bool;

    /// Whether a bucket exists
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create a bucket
    async fn make_bucket(&self, bucket: &str, options: &BucketOptions) -> Result<()>;
}

/// Port for building object store clients
pub trait ObjectStoreConnector: Send + Sync {
    /// Client for the server at `endpoint` using `credential`
    fn connect(&self, endpoint: &Endpoint, credential: &Credential) -> Result<Arc<dyn ObjectStore>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterClientRef = Arc<dyn ClusterClient>;
pub type ObjectStoreConnectorRef = Arc<dyn ObjectStoreConnector>;
