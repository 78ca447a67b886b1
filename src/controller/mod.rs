//! Minio Controller
//!
//! Wires the change detector, the trigger queue and a pool of reconcile
//! workers together.
//!
//! ```text
//! watch events ──> handlers ──> WorkQueue<ObjectKey> ──> workers ──> Reconciler
//!                                     ^                                  │
//!                                     └──────── add_rate_limited ────────┘
//! ```

pub mod handler;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use handler::{
    DeletedObject, MinioEventHandler, PodEventHandler, ResourceEventHandler, ServiceEventHandler,
};
pub use queue::WorkQueue;
pub use reconciler::Reconciler;

use crate::crd::Minio;
use crate::domain::ports::{ClusterClientRef, ObjectCache, ObjectKey, ObjectStoreConnectorRef};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::{Metrics, ReconcileResult};
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long a created pod may take to become ready
    pub pod_ready_timeout: Duration,
    /// Poll interval of the pod readiness wait
    pub pod_ready_interval: Duration,
    /// How long the object store may take to come online
    pub bootstrap_timeout: Duration,
    /// Poll interval of the bootstrap loop
    pub bootstrap_interval: Duration,
    /// Region buckets are created in
    pub bucket_region: String,
    /// Bucket proving the object store finished initializing
    pub marker_bucket: String,
    /// How long to wait for the initial cache listing
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pod_ready_timeout: Duration::from_secs(30),
            pod_ready_interval: Duration::from_secs(1),
            bootstrap_timeout: Duration::from_secs(60),
            bootstrap_interval: Duration::from_secs(10),
            bucket_region: "us-east-1".to_string(),
            marker_bucket: "testbucket".to_string(),
            cache_sync_timeout: Duration::from_secs(120),
        }
    }
}

/// Read-only views of the watched kinds
#[derive(Clone)]
pub struct Caches {
    pub minios: Arc<dyn ObjectCache<Minio>>,
    pub pods: Arc<dyn ObjectCache<Pod>>,
    pub services: Arc<dyn ObjectCache<Service>>,
    pub nodes: Arc<dyn ObjectCache<Node>>,
}

impl Caches {
    /// Whether every cache has observed its initial listing
    pub fn has_synced(&self) -> bool {
        self.minios.has_synced()
            && self.pods.has_synced()
            && self.services.has_synced()
            && self.nodes.has_synced()
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct Controller {
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
    metrics: Metrics,
    config: ControllerConfig,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Build a controller.
    ///
    /// Cancelling `shutdown` stops the queue and cancels the readiness and
    /// bootstrap waits of passes in flight.
    pub fn new(
        caches: Caches,
        client: ClusterClientRef,
        connector: ObjectStoreConnectorRef,
        config: ControllerConfig,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        let reconciler = Reconciler::new(
            caches,
            client,
            connector,
            config.clone(),
            metrics.clone(),
            shutdown.clone(),
        );
        let queue = WorkQueue::new().with_depth_gauge(metrics.queue_depth_gauge());
        Self {
            queue: Arc::new(queue),
            reconciler: Arc::new(reconciler),
            metrics,
            config,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    pub fn minio_handler(&self) -> Arc<dyn ResourceEventHandler<Minio>> {
        Arc::new(MinioEventHandler::new(self.queue()))
    }

    pub fn pod_handler(&self) -> Arc<dyn ResourceEventHandler<Pod>> {
        Arc::new(PodEventHandler::new(
            self.queue(),
            Arc::clone(&self.reconciler.caches().minios),
        ))
    }

    pub fn service_handler(&self) -> Arc<dyn ResourceEventHandler<Service>> {
        Arc::new(ServiceEventHandler::new(
            self.queue(),
            Arc::clone(&self.reconciler.caches().minios),
        ))
    }

    /// Wait for the caches, then spawn `workers` reconcile workers.
    ///
    /// `stop` is folded into the controller's shutdown token: firing either
    /// aborts the cache wait, shuts the queue down and cancels in-flight
    /// waits. Fails when the caches do not sync in time or shutdown comes
    /// first.
    pub async fn start(&self, workers: usize, stop: CancellationToken) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let queue = self.queue();
        let linked = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = linked.cancelled() => shutdown.cancel(),
                _ = shutdown.cancelled() => {}
            }
            queue.shut_down();
        });

        self.wait_for_cache_sync(&stop).await?;

        let mut handles = self.workers.lock();
        for id in 0..workers.max(1) {
            handles.push(tokio::spawn(run_worker(
                id,
                self.queue(),
                Arc::clone(&self.reconciler),
                self.metrics.clone(),
            )));
        }
        info!(workers = handles.len(), "Controller started");
        Ok(())
    }

    /// Stop handing out work, cancel in-flight waits and wait for the
    /// workers to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.queue.shut_down();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker panicked");
            }
        }
        info!("Controller stopped");
    }

    /// Run one reconcile pass for `key`
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        self.reconciler.reconcile(key).await
    }

    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> Result<()> {
        let caches = self.reconciler.caches();
        let poll = async {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            while !caches.has_synced() {
                ticker.tick().await;
            }
        };
        tokio::select! {
            _ = stop.cancelled() => Err(Error::Cancelled {
                operation: "cache sync".to_string(),
            }),
            _ = self.shutdown.cancelled() => Err(Error::Cancelled {
                operation: "cache sync".to_string(),
            }),
            res = tokio::time::timeout(self.config.cache_sync_timeout, poll) => {
                res.map_err(|_| Error::CacheSync(format!(
                    "caches not synced after {:?}",
                    self.config.cache_sync_timeout
                )))?;
                info!("Caches synced");
                Ok(())
            }
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
    metrics: Metrics,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        let start = Instant::now();

        match reconciler.reconcile(&key).await {
            Ok(()) => {
                metrics.observe_reconcile(ReconcileResult::Success, start.elapsed());
                queue.forget(&key);
            }
            Err(e) => {
                metrics.observe_reconcile(ReconcileResult::Error, start.elapsed());
                match e.action() {
                    ErrorAction::RequeueWithBackoff => {
                        warn!(
                            key = %key,
                            error = %e,
                            retries = queue.num_requeues(&key),
                            "Reconcile failed, requeueing"
                        );
                        queue.add_rate_limited(key.clone());
                    }
                    ErrorAction::NoRequeue => {
                        error!(key = %key, error = %e, "Reconcile failed, not requeueing");
                        queue.forget(&key);
                    }
                }
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{minio, Harness};
    use crate::crd::MinioSpec;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_cache_sync() {
        let h = Harness::new(&["n1"]);
        h.pods.set_synced(false);
        let controller = h.controller();

        let shutdown = CancellationToken::new();
        let pods = Arc::clone(&h.pods);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            pods.set_synced(true);
        });

        let start = tokio::time::Instant::now();
        controller.start(1, shutdown).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_caches_never_sync() {
        let h = Harness::new(&["n1"]);
        h.nodes.set_synced(false);
        let controller = h.controller();

        let err = controller.start(1, CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::CacheSync(_));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_aborts_on_shutdown() {
        let h = Harness::new(&["n1"]);
        h.minios.set_synced(false);
        let controller = h.controller();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = controller.start(2, shutdown).await.unwrap_err();
        assert_matches!(err, Error::Cancelled { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_reconcile_enqueued_workloads() {
        let h = Harness::new(&["n1", "n2"]);
        h.add_minio(minio("store", "minio-a", MinioSpec { replicas: 2, ..Default::default() }));
        let controller = h.controller();

        let m = h.minio("store", "minio-a");
        controller.minio_handler().on_add(&m);
        controller.start(2, CancellationToken::new()).await.unwrap();

        while !h.minio("store", "minio-a").is_initialized() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        controller.stop().await;

        assert_eq!(h.client.created_pods().len(), 2);
        assert_eq!(controller.queue().num_requeues(&ObjectKey::new("store", "minio-a")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pass_is_retried_with_backoff() {
        let h = Harness::new(&["n1"]);
        h.client.set_pods_ready(false);
        h.add_minio(minio("store", "minio-a", MinioSpec::default()));
        let controller = h.controller();
        let key = ObjectKey::new("store", "minio-a");

        let start = tokio::time::Instant::now();
        controller.queue().add(key.clone());
        controller.start(1, CancellationToken::new()).await.unwrap();

        // The first pass times out on readiness, the retry finds the pod
        while !h.minio("store", "minio-a").is_initialized() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        controller.stop().await;

        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(controller.queue().num_requeues(&key), 0);
        assert_eq!(h.client.created_pods().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_cancels_in_flight_pass() {
        let h = Harness::new(&["n1"]);
        h.client.set_pods_ready(false);
        h.add_minio(minio("store", "minio-a", MinioSpec::default()));
        let controller = h.controller();
        let key = ObjectKey::new("store", "minio-a");

        let stop = CancellationToken::new();
        let start = tokio::time::Instant::now();
        controller.queue().add(key.clone());
        controller.start(1, stop.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        stop.cancel();
        controller.stop().await;

        // The readiness wait gave up long before its own timeout
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(controller.queue().is_shutting_down());
        assert_eq!(controller.queue().num_requeues(&key), 0);
        assert!(!h.minio("store", "minio-a").is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_shuts_queue_down() {
        let h = Harness::new(&["n1"]);
        let controller = h.controller();

        let stop = CancellationToken::new();
        controller.start(1, stop.clone()).await.unwrap();
        stop.cancel();

        while !controller.queue().is_shutting_down() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_workload_deleted_mid_pass_is_not_requeued() {
        let h = Harness::new(&["n1"]);
        h.client.vanish_on_status(true);
        h.add_minio(minio("store", "minio-a", MinioSpec::default()));
        let controller = h.controller();
        let key = ObjectKey::new("store", "minio-a");

        controller.queue().add(key.clone());
        controller.start(1, CancellationToken::new()).await.unwrap();

        while h.client.created_pods().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        controller.stop().await;

        assert_eq!(controller.queue().num_requeues(&key), 0);
        assert!(controller.queue().is_empty());
        assert_eq!(h.client.created_pods().len(), 1);
    }
}
