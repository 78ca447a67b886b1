//! Change Detector
//!
//! Turns raw add/update/delete notifications of the watched kinds into the
//! identity of the Minio workload that has to be reconciled. Notifications
//! that cannot be traced back to a live workload are dropped without error.

use crate::controller::queue::WorkQueue;
use crate::crd::{Minio, APP_NAME_LABEL};
use crate::domain::ports::{ObjectCache, ObjectKey};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::debug;

/// A delete notification.
///
/// When the watch lost track of the object its final state is unknown and
/// only the key plus the last state seen by the cache are available.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    Live(K),
    FinalStateUnknown { key: String, last_known: Option<K> },
}

impl<K> DeletedObject<K> {
    /// Best known state of the deleted object
    pub fn object(&self) -> Option<&K> {
        match self {
            DeletedObject::Live(obj) => Some(obj),
            DeletedObject::FinalStateUnknown { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Receiver of cache notifications for kind `K`
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &DeletedObject<K>);
}

fn version_changed<K: Resource>(old: &K, new: &K) -> bool {
    old.meta().resource_version != new.meta().resource_version
}

// =============================================================================
// Minio Events
// =============================================================================

/// Enqueues the workload itself
pub struct MinioEventHandler {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl MinioEventHandler {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { queue }
    }
}

impl ResourceEventHandler<Minio> for MinioEventHandler {
    fn on_add(&self, obj: &Minio) {
        if let Some(key) = ObjectKey::of(obj) {
            self.queue.add(key);
        }
    }

    fn on_update(&self, old: &Minio, new: &Minio) {
        if !version_changed(old, new) {
            return;
        }
        if let Some(key) = ObjectKey::of(new) {
            self.queue.add(key);
        }
    }

    fn on_delete(&self, obj: &DeletedObject<Minio>) {
        let key = match obj {
            DeletedObject::Live(minio) => ObjectKey::of(minio),
            DeletedObject::FinalStateUnknown { key, .. } => ObjectKey::parse(key).ok(),
        };
        if let Some(key) = key {
            self.queue.add(key);
        }
    }
}

// =============================================================================
// Owned Object Events
// =============================================================================

/// Resolve the workload owning `obj` through its app-name label
fn owning_workload<K: Resource>(obj: &K, minios: &dyn ObjectCache<Minio>) -> Option<ObjectKey> {
    let app = obj.labels().get(APP_NAME_LABEL)?;
    let namespace = obj.namespace().unwrap_or_default();
    match minios.get(&namespace, app) {
        Some(minio) => Some(minio.key()),
        None => {
            debug!(namespace = %namespace, app = %app, "Owning workload not in cache, dropping event");
            None
        }
    }
}

macro_rules! owned_object_handler {
    ($name:ident, $kind:ty) => {
        /// Enqueues the workload owning the object
        pub struct $name {
            queue: Arc<WorkQueue<ObjectKey>>,
            minios: Arc<dyn ObjectCache<Minio>>,
        }

        impl $name {
            pub fn new(queue: Arc<WorkQueue<ObjectKey>>, minios: Arc<dyn ObjectCache<Minio>>) -> Self {
                Self { queue, minios }
            }

            fn enqueue_owner(&self, obj: &$kind) {
                if let Some(key) = owning_workload(obj, self.minios.as_ref()) {
                    self.queue.add(key);
                }
            }
        }

        impl ResourceEventHandler<$kind> for $name {
            fn on_add(&self, obj: &$kind) {
                self.enqueue_owner(obj);
            }

            fn on_update(&self, old: &$kind, new: &$kind) {
                if version_changed(old, new) {
                    self.enqueue_owner(new);
                }
            }

            fn on_delete(&self, obj: &DeletedObject<$kind>) {
                if let Some(obj) = obj.object() {
                    self.enqueue_owner(obj);
                }
            }
        }
    };
}

owned_object_handler!(PodEventHandler, Pod);
owned_object_handler!(ServiceEventHandler, Service);
