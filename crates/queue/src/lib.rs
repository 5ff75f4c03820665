//! Keel work queue: deduplicating, rate-limited FIFO of reconciliation keys.
//!
//! A key is held at most once, whether queued or in flight. Enqueuing a key
//! that is being processed marks it dirty, and `done` puts it back exactly once.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use keel_core::ResourceKey;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

mod rate_limit;

pub use rate_limit::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimitConfig, RateLimiter,
};

#[derive(Default)]
struct State {
    queue: VecDeque<ResourceKey>,
    /// Keys that need processing: queued, or to be re-queued on `done`.
    dirty: FxHashSet<ResourceKey>,
    /// Keys handed out by `get` and not yet `done`.
    processing: FxHashSet<ResourceKey>,
    /// Pending delayed adds and their ready time; the earliest wins.
    waiting: FxHashMap<ResourceKey, Instant>,
    /// Whether the delay timer task is alive.
    timer_running: bool,
    /// Errors counted against the attempt ceiling, per key.
    failures: FxHashMap<ResourceKey, u32>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    /// Wakes the delay timer when an earlier deadline arrives or on shutdown.
    timer_wake: Arc<Notify>,
    limiter: Box<dyn RateLimiter>,
    retry_delay: Duration,
    max_attempts: Option<u32>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_depth(&self, depth: usize) {
        gauge!("keel_queue_depth", depth as f64, "name" => self.name.clone());
    }
}

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: &str, cfg: &RateLimitConfig) -> Self {
        Self::with_limiter(name, Box::new(cfg.build()), cfg.base_delay, cfg.max_attempts)
    }

    /// `retry_delay` is the fixed wait of `enqueue_retry`.
    pub fn with_limiter(
        name: &str,
        limiter: Box<dyn RateLimiter>,
        retry_delay: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                timer_wake: Arc::new(Notify::new()),
                limiter,
                retry_delay,
                max_attempts,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule `key`. A no-op when the key is already queued; when the key is
    /// in flight it is redelivered once after `done`.
    pub fn enqueue(&self, key: ResourceKey) {
        let mut st = self.inner.state();
        if st.shutting_down {
            trace!(%key, "enqueue after shutdown ignored");
            return;
        }
        if !st.dirty.insert(key.clone()) {
            return;
        }
        counter!("keel_queue_adds_total", 1u64, "name" => self.inner.name.clone());
        if st.processing.contains(&key) {
            debug!(%key, "key in flight; will redeliver after done");
            return;
        }
        st.queue.push_back(key);
        self.inner.report_depth(st.queue.len());
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Schedule `key` once `delay` has elapsed. Must be called within a tokio runtime.
    pub fn enqueue_after(&self, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let ready = Instant::now() + delay;
        let spawn_timer = {
            let mut st = self.inner.state();
            if st.shutting_down {
                return;
            }
            if matches!(st.waiting.get(&key), Some(at) if *at <= ready) {
                return;
            }
            st.waiting.insert(key, ready);
            !std::mem::replace(&mut st.timer_running, true)
        };
        if spawn_timer {
            tokio::spawn(run_timer(Arc::downgrade(&self.inner), Arc::clone(&self.inner.timer_wake)));
        } else {
            self.inner.timer_wake.notify_one();
        }
    }

    /// Schedule `key` after the fixed retry delay. Records no failure and
    /// does not grow the key's backoff.
    pub fn enqueue_retry(&self, key: ResourceKey) -> Duration {
        let delay = self.inner.retry_delay;
        self.enqueue_after(key, delay);
        delay
    }

    /// Schedule `key` after the limiter's delay for it, recording a failure.
    pub fn enqueue_rate_limited(&self, key: ResourceKey) -> Duration {
        let delay = self.inner.limiter.when(&key);
        counter!("keel_queue_retries_total", 1u64, "name" => self.inner.name.clone());
        self.enqueue_after(key, delay);
        delay
    }

    /// Next key to process. Waits while the queue is empty; `None` once shut down and drained.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = self.inner.state();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let remaining = st.queue.len();
                    self.inner.report_depth(remaining);
                    drop(st);
                    if remaining > 0 {
                        // hand the baton to another idle worker
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` finished.
    pub fn done(&self, key: &ResourceKey) {
        let mut st = self.inner.state();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            self.inner.report_depth(st.queue.len());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Clear retry state for `key`: backoff and counted errors.
    pub fn forget(&self, key: &ResourceKey) {
        self.inner.limiter.forget(key);
        self.inner.state().failures.remove(key);
    }

    /// Rate-limited requeues of `key` since the last `forget`.
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Count one more error of `key` against the attempt ceiling; returns the new count.
    pub fn record_failure(&self, key: &ResourceKey) -> u32 {
        let mut st = self.inner.state();
        let n = st.failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    pub fn failures(&self, key: &ResourceKey) -> u32 {
        self.inner.state().failures.get(key).copied().unwrap_or(0)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.inner.max_attempts
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently handed out and not yet `done`.
    pub fn in_flight(&self) -> usize {
        self.inner.state().processing.len()
    }

    /// Stop accepting keys. Already queued keys are still handed out, then `get` returns `None`.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state();
            st.shutting_down = true;
            st.waiting.clear();
        }
        debug!(name = %self.inner.name, "work queue shutting down");
        self.inner.notify.notify_waiters();
        self.inner.timer_wake.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().shutting_down
    }

    /// Keys waiting on a delayed add.
    pub fn delayed(&self) -> usize {
        self.inner.state().waiting.len()
    }
}

/// One task per queue moves due keys from `waiting` into the queue. It exits
/// when nothing is waiting, on shutdown, or once the queue is dropped.
async fn run_timer(queue: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        let Some(inner) = queue.upgrade() else { return };
        let now = Instant::now();
        let (due, next) = {
            let mut st = inner.state();
            if st.shutting_down {
                st.timer_running = false;
                return;
            }
            let due: Vec<ResourceKey> =
                st.waiting.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
            for key in &due {
                st.waiting.remove(key);
            }
            let next = st.waiting.values().min().copied();
            if next.is_none() {
                st.timer_running = false;
            }
            (due, next)
        };
        let handle = WorkQueue { inner };
        for key in due {
            handle.enqueue(key);
        }
        drop(handle);
        let Some(next) = next else { return };
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = wake.notified() => {}
        }
    }
}
