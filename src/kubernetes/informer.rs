//! Watch-backed object cache
//!
//! Keeps an in-memory copy of one kind of object fed by a kube watcher and
//! forwards every change to the registered event handlers.

use crate::controller::handler::{DeletedObject, ResourceEventHandler};
use crate::domain::ports::{ObjectCache, ObjectKey};
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Informer<K> {
    kind: &'static str,
    store: DashMap<ObjectKey, Arc<K>>,
    synced: AtomicBool,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            store: DashMap::new(),
            synced: AtomicBool::new(false),
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Register a handler; it sees every change from now on.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.write().push(handler);
    }

    /// Watch `api` until `shutdown` fires.
    ///
    /// Watch errors are retried with backoff.
    pub async fn run(self: Arc<Self>, api: Api<K>, shutdown: CancellationToken) {
        info!(kind = self.kind, "Starting watch");
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watch error"),
                    None => break,
                },
            }
        }
        info!(kind = self.kind, "Watch stopped");
    }

    /// Fold one watch event into the store.
    pub fn apply(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Applied(obj) => self.upsert(obj),
            watcher::Event::Deleted(obj) => {
                if let Some(key) = ObjectKey::of(&obj) {
                    self.store.remove(&key);
                }
                let deleted = DeletedObject::Live(obj);
                self.dispatch(|h| h.on_delete(&deleted));
            }
            watcher::Event::Restarted(objs) => {
                let mut seen = HashSet::with_capacity(objs.len());
                for obj in objs {
                    if let Some(key) = ObjectKey::of(&obj) {
                        seen.insert(key);
                    }
                    self.upsert(obj);
                }

                let vanished: Vec<ObjectKey> = self
                    .store
                    .iter()
                    .filter(|entry| !seen.contains(entry.key()))
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in vanished {
                    if let Some((key, last)) = self.store.remove(&key) {
                        let deleted = DeletedObject::FinalStateUnknown {
                            key: key.to_string(),
                            last_known: Some((*last).clone()),
                        };
                        self.dispatch(|h| h.on_delete(&deleted));
                    }
                }

                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!(kind = self.kind, objects = self.store.len(), "Cache synced");
                }
            }
        }
    }

    fn upsert(&self, obj: K) {
        let Some(key) = ObjectKey::of(&obj) else {
            debug!(kind = self.kind, "Ignoring object without a name");
            return;
        };
        let new = Arc::new(obj);
        match self.store.insert(key, Arc::clone(&new)) {
            Some(old) => self.dispatch(|h| h.on_update(&old, &new)),
            None => self.dispatch(|h| h.on_add(&new)),
        }
    }

    fn dispatch(&self, f: impl Fn(&dyn ResourceEventHandler<K>)) {
        let handlers = self.handlers.read().clone();
        for handler in &handlers {
            f(handler.as_ref());
        }
    }
}

impl<K> ObjectCache<K> for Informer<K>
where
    K: Send + Sync,
{
    fn list(&self) -> Vec<Arc<K>> {
        self.store.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store
            .get(&ObjectKey::new(namespace, name))
            .map(|e| Arc::clone(e.value()))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
