//! Readiness waiter and bootstrap poller
//!
//! Both loops are bounded by a timeout and stop early when the process
//! shuts down.

use crate::domain::ports::{BucketOptions, ObjectCache, ObjectStore};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether the pod reports its Ready condition true
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Run `fut` until it finishes, `timeout` elapses, or `shutdown` fires.
async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    shutdown: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(Error::Cancelled {
            operation: operation.to_string(),
        }),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            after: timeout,
        }),
    }
}

// =============================================================================
// Pod Readiness
// =============================================================================

/// Poll the pod cache until `namespace/name` is ready.
pub async fn wait_for_pod_ready(
    pods: &dyn ObjectCache<Pod>,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    let poll = async {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match pods.get(namespace, name) {
                Some(pod) if is_pod_ready(&pod) => return,
                Some(_) => debug!(pod = %name, "Pod not ready yet"),
                None => debug!(pod = %name, "Pod not observed yet"),
            }
        }
    };
    bounded(&format!("readiness of pod {}/{}", namespace, name), timeout, shutdown, poll).await
}

// =============================================================================
// Bootstrap
// =============================================================================

/// What the bootstrap poller has to make exist
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    /// Bucket whose presence proves the server finished initializing
    pub marker_bucket: String,
    /// Buckets configured on the workload
    pub buckets: Vec<String>,
    pub options: BucketOptions,
}

async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str, options: &BucketOptions) -> Result<bool> {
    if store.bucket_exists(bucket).await? {
        return Ok(false);
    }
    store.make_bucket(bucket, options).await?;
    Ok(true)
}

/// One bootstrap attempt; true once the marker bucket exists.
async fn try_bootstrap(store: &dyn ObjectStore, plan: &BootstrapPlan) -> bool {
    if !store.is_online().await {
        debug!("Object store is not online yet");
        return false;
    }

    match ensure_bucket(store, &plan.marker_bucket, &plan.options).await {
        Ok(created) => {
            if created {
                info!(bucket = %plan.marker_bucket, "Created marker bucket");
            }
        }
        Err(e) => {
            warn!(bucket = %plan.marker_bucket, error = %e, "Marker bucket not available");
            return false;
        }
    }

    for bucket in &plan.buckets {
        match ensure_bucket(store, bucket, &plan.options).await {
            Ok(true) => info!(bucket = %bucket, "Created bucket"),
            Ok(false) => {}
            Err(e) => warn!(bucket = %bucket, error = %e, "Failed to create bucket"),
        }
    }
    true
}

/// Wait for the object store to come online and ensure its buckets.
///
/// Succeeds once the marker bucket exists; failures on configured buckets
/// are logged and do not keep the loop going.
pub async fn bootstrap(
    store: &dyn ObjectStore,
    plan: &BootstrapPlan,
    interval: Duration,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    let poll = async {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if try_bootstrap(store, plan).await {
                return;
            }
        }
    };
    bounded("object store bootstrap", timeout, shutdown, poll).await
}
