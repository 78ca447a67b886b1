//! Operator Metrics
//!
//! Prometheus collectors for reconcile passes and the trigger queue.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

/// Outcome label of a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    Error,
}

impl ReconcileResult {
    fn as_str(self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Error => "error",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    reconcile_total: IntCounterVec,
    reconcile_duration: Histogram,
    queue_depth: IntGauge,
    pods_created: IntCounter,
}

impl Metrics {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconcile_total = IntCounterVec::new(
            Opts::new("minio_operator_reconcile_total", "Reconcile passes by result"),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "minio_operator_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
        )?;
        let queue_depth = IntGauge::new(
            "minio_operator_queue_depth",
            "Workload identities waiting in the trigger queue",
        )?;
        let pods_created = IntCounter::new(
            "minio_operator_pods_created_total",
            "Replica pods created",
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(pods_created.clone()))?;

        Ok(Self {
            reconcile_total,
            reconcile_duration,
            queue_depth,
            pods_created,
        })
    }

    pub fn observe_reconcile(&self, result: ReconcileResult, elapsed: Duration) {
        self.reconcile_total
            .with_label_values(&[result.as_str()])
            .inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    /// Gauge the trigger queue keeps at its number of waiting items
    pub fn queue_depth_gauge(&self) -> IntGauge {
        self.queue_depth.clone()
    }

    pub fn pod_created(&self) {
        self.pods_created.inc();
    }
}
