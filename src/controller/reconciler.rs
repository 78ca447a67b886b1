//! Reconcile Engine
//!
//! One pass converges a single Minio workload:
//!
//! ```text
//! fetch -> default -> node census -> services -> pods -> persist spec
//!       -> bootstrap -> status
//! ```
//!
//! Every step is safe to repeat. A pass that fails part-way leaves the
//! objects it already created in place and the next pass picks up from
//! the observed state.

use super::resources::{build_pod, desired_services};
use super::wait::{bootstrap, wait_for_pod_ready, BootstrapPlan};
use super::{Caches, ControllerConfig};
use crate::allocation::{ready_nodes, AllocationPool};
use crate::crd::{Minio, NODE_NAME_ANNOTATION};
use crate::domain::ports::{
    BucketOptions, ClusterClientRef, Endpoint, ObjectKey, ObjectStoreConnectorRef,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node a live pod runs on, preferring the placement it was created with
fn pod_node(pod: &Pod) -> Option<String> {
    pod.annotations()
        .get(NODE_NAME_ANNOTATION)
        .cloned()
        .or_else(|| pod.spec.as_ref().and_then(|s| s.node_name.clone()))
        .filter(|n| !n.is_empty())
}

pub struct Reconciler {
    caches: Caches,
    client: ClusterClientRef,
    connector: ObjectStoreConnectorRef,
    config: ControllerConfig,
    metrics: Metrics,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        caches: Caches,
        client: ClusterClientRef,
        connector: ObjectStoreConnectorRef,
        config: ControllerConfig,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            caches,
            client,
            connector,
            config,
            metrics,
            shutdown,
        }
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Run one pass for `key`.
    ///
    /// Errors are wrapped with the workload identity.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(cached) = self.caches.minios.get(&key.namespace, &key.name) else {
            info!(key = %key, "Minio no longer exists, nothing to do");
            return Ok(());
        };

        let mut minio = (*cached).clone();
        minio.spec.apply_defaults();

        // Node census
        let nodes = ready_nodes(&self.caches.nodes.list());
        let mut changed = false;
        if minio.force_singleton(nodes.len()) {
            info!(key = %key, "Only one ready node, running a single replica");
            changed = true;
        }

        self.sync_services(&minio)
            .await
            .map_err(|e| e.for_key(key))?;

        let annotations_before = minio.metadata.annotations.clone();
        let pods_result = self.sync_pods(&mut minio, &nodes).await;
        changed |= minio.metadata.annotations != annotations_before;

        if changed {
            match self.client.update_minio(&minio).await {
                Ok(updated) => {
                    minio.metadata.resource_version = updated.metadata.resource_version;
                }
                Err(e) if e.is_not_found() => {
                    info!(key = %key, "Minio deleted during reconcile");
                    return Ok(());
                }
                Err(e) => {
                    if let Err(pod_err) = &pods_result {
                        warn!(key = %key, error = %pod_err, "Pod sync failed");
                    }
                    return Err(e.for_key(key));
                }
            }
        }
        pods_result.map_err(|e| e.for_key(key))?;

        self.bootstrap(&minio).await.map_err(|e| e.for_key(key))?;

        if !minio.is_initialized() {
            minio.mark_initialized();
            match self.client.update_minio_status(&minio).await {
                Ok(_) => info!(key = %key, "Minio initialized"),
                Err(e) if e.is_not_found() => {
                    info!(key = %key, "Minio deleted during reconcile");
                }
                Err(e) => return Err(e.for_key(key)),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Services
    // =========================================================================

    async fn sync_services(&self, minio: &Minio) -> Result<()> {
        let namespace = minio.namespace().unwrap_or_default();
        for service in desired_services(minio) {
            let name = service.name_any();
            if self.caches.services.get(&namespace, &name).is_some() {
                continue;
            }
            match self.client.create_service(&service).await {
                Ok(_) => info!(service = %name, namespace = %namespace, "Created service"),
                Err(e) if e.is_already_exists() => {
                    debug!(service = %name, "Service already exists");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Pods
    // =========================================================================

    async fn sync_pods(&self, minio: &mut Minio, nodes: &[String]) -> Result<()> {
        let namespace = minio.namespace().unwrap_or_default();
        let mut pool = AllocationPool::new(nodes);
        let mut missing = Vec::new();

        for index in 0..minio.spec.replicas {
            let name = minio.pod_name(index);
            match self.caches.pods.get(&namespace, &name) {
                Some(pod) => {
                    if let Some(node) = pod_node(&pod) {
                        pool.bump(&node);
                        minio.record_placement(&name, &node);
                    }
                }
                None => missing.push(name),
            }
        }

        for name in missing {
            let recorded = minio.recorded_node(&name).map(str::to_string);
            let placement = pool
                .place(&name, recorded.as_deref())
                .ok_or_else(|| Error::SchedulingExhausted { pod: name.clone() })?;

            let pod = build_pod(minio, &name, &placement.node);
            match self.client.create_pod(&pod).await {
                Ok(_) => {
                    self.metrics.pod_created();
                    info!(
                        pod = %name,
                        node = %placement.node,
                        reused = placement.reused,
                        "Created pod"
                    );
                    minio.record_placement(&name, &placement.node);
                }
                Err(e) if e.is_already_exists() => {
                    // The pod runs wherever it was created, not where we picked
                    pool.release(&placement.node);
                    let existing = self.caches.pods.get(&namespace, &name);
                    let Some(node) = existing.as_deref().and_then(pod_node) else {
                        warn!(pod = %name, "Pod exists but is not cached yet");
                        return Err(e);
                    };
                    debug!(pod = %name, node = %node, "Pod already exists");
                    pool.bump(&node);
                    minio.record_placement(&name, &node);
                }
                Err(e) => return Err(e),
            }

            wait_for_pod_ready(
                self.caches.pods.as_ref(),
                &namespace,
                &name,
                self.config.pod_ready_interval,
                self.config.pod_ready_timeout,
                &self.shutdown,
            )
            .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    fn endpoint(&self, minio: &Minio) -> Endpoint {
        let service = if minio.wants_external_service() {
            minio.external_service_name()
        } else {
            minio.internal_service_name()
        };
        Endpoint {
            host: format!("{}.{}", service, minio.namespace().unwrap_or_default()),
            port: minio.spec.port.api_port,
            secure: false,
        }
    }

    async fn bootstrap(&self, minio: &Minio) -> Result<()> {
        let endpoint = self.endpoint(minio);
        let store = self.connector.connect(&endpoint, &minio.spec.credential)?;
        let plan = BootstrapPlan {
            marker_bucket: self.config.marker_bucket.clone(),
            buckets: minio.spec.buckets.clone(),
            options: BucketOptions {
                region: self.config.bucket_region.clone(),
                object_locking: !minio.spec.is_singleton(),
            },
        };
        debug!(endpoint = %endpoint, "Bootstrapping object store");
        bootstrap(
            store.as_ref(),
            &plan,
            self.config.bootstrap_interval,
            self.config.bootstrap_timeout,
            &self.shutdown,
        )
        .await
    }
}
