//! Trigger Queue
//!
//! Deduplicating work queue of workload identities feeding the reconcile
//! workers. An identity is handed to at most one worker at a time; adds
//! that arrive while it is being processed collapse into one pending
//! re-entry that becomes visible once the worker calls [`WorkQueue::done`].

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use prometheus::IntGauge;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Rate Limiters
// =============================================================================

/// Decides how long an item waits before it is re-added after a failure
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `item`
    fn when(&self, item: &K) -> Duration;

    /// Drop the retry history of `item`
    fn forget(&self, item: &K);

    /// Number of retries recorded for `item`
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item exponential backoff
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, (ExponentialBackoff, u32)>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ItemExponentialRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = self.failures.lock();
        let entry = failures
            .entry(item.clone())
            .or_insert_with(|| (self.backoff(), 0));
        entry.1 += 1;
        entry.0.next_backoff().unwrap_or(self.max)
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).map(|(_, n)| *n).unwrap_or(0)
    }
}

/// Overall token bucket shared by every item
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            state: Mutex::new((burst as f64, Instant::now())),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(state.1).as_secs_f64() * self.qps;
        state.0 = (state.0 + refill).min(self.burst);
        state.1 = now;

        // Reserve a token even when the bucket is empty
        state.0 -= 1.0;
        if state.0 >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.0 / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Waits for the longest delay any of its limiters asks for
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, item: &K) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff from 5ms up to 1000s, capped overall at
/// 10 retries per second with a burst of 100.
pub fn default_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

// =============================================================================
// Work Queue
// =============================================================================

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Rate-limited, delay-capable, deduplicating queue
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    shutdown: CancellationToken,
    depth: Option<IntGauge>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Queue using [`default_rate_limiter`]
    pub fn new() -> Self {
        Self::with_rate_limiter(Box::new(default_rate_limiter()))
    }

    pub fn with_rate_limiter(limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
            shutdown: CancellationToken::new(),
            depth: None,
        }
    }

    /// Keep `gauge` at the number of waiting items
    pub fn with_depth_gauge(mut self, gauge: IntGauge) -> Self {
        gauge.set(self.len() as i64);
        self.depth = Some(gauge);
        self
    }

    fn publish_depth(&self, len: usize) {
        if let Some(gauge) = &self.depth {
            gauge.set(len as i64);
        }
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // Re-queued by done()
            return;
        }
        state.queue.push_back(item);
        let len = state.queue.len();
        drop(state);
        self.publish_depth(len);
        self.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed.
    ///
    /// Pending delayed adds are dropped on shutdown.
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Add `item` after the delay its failure history calls for.
    pub fn add_rate_limited(self: &Arc<Self>, item: K) {
        let delay = self.limiter.when(&item);
        tracing::debug!(item = ?item, delay = ?delay, "Requeue with backoff");
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.publish_depth(state.queue.len());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`.
    ///
    /// An add that arrived meanwhile puts it straight back in the queue.
    pub fn done(&self, item: &K) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            let len = state.queue.len();
            drop(state);
            self.publish_depth(len);
            self.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every waiting worker.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of items waiting to be picked up
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
