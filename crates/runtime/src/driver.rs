//! Worker loops: dequeue a key, reconcile it, report the result to the queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use keel_core::{ErrorClass, ReconcileError, ReconcileOutcome, ResourceKey};
use keel_queue::WorkQueue;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::Reconciler;

/// What the driver did with a key after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Converged; retry state cleared.
    Converged,
    /// Scheduled again after the given backoff.
    Requeued(Duration),
    /// Scheduled again after the fixed retry delay, without backoff escalation.
    Retried(Duration),
    /// Attempts exhausted; key dropped and reported.
    Dropped,
}

impl Disposition {
    fn label(&self) -> &'static str {
        match self {
            Disposition::Converged => "converged",
            Disposition::Requeued(_) => "requeued",
            Disposition::Retried(_) => "retried",
            Disposition::Dropped => "dropped",
        }
    }
}

/// Run `workers` loops until the queue shuts down and drains.
pub async fn run_workers<R>(queue: WorkQueue, reconciler: Arc<R>, workers: usize)
where
    R: Reconciler + ?Sized,
{
    let mut set = JoinSet::new();
    for id in 0..workers.max(1) {
        let queue = queue.clone();
        let reconciler = Arc::clone(&reconciler);
        set.spawn(async move {
            while let Some(key) = queue.get().await {
                process(&queue, reconciler.as_ref(), key).await;
            }
            debug!(worker = id, "worker exiting");
        });
    }
    info!(controller = reconciler.name(), workers = workers.max(1), "workers started");
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "worker task failed");
        }
    }
    info!(controller = reconciler.name(), "workers stopped");
}

/// Reconcile one dequeued key and settle it with the queue.
pub async fn process<R>(queue: &WorkQueue, reconciler: &R, key: ResourceKey) -> Disposition
where
    R: Reconciler + ?Sized,
{
    let name = reconciler.name().to_string();
    let started = Instant::now();
    let result = AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await;
    histogram!("keel_reconcile_duration_seconds", started.elapsed().as_secs_f64(), "controller" => name.clone());

    let disposition = match result {
        Ok(Ok(ReconcileOutcome::Converged)) => {
            debug!(controller = %name, %key, "converged");
            queue.forget(&key);
            Disposition::Converged
        }
        Ok(Ok(ReconcileOutcome::Requeue)) => {
            let delay = queue.enqueue_rate_limited(key.clone());
            debug!(controller = %name, %key, delay_ms = delay.as_millis() as u64, "requeue to verify");
            Disposition::Requeued(delay)
        }
        Ok(Err(err)) => on_error(queue, reconciler, &key, err).await,
        Err(_) => {
            error!(controller = %name, %key, "reconcile panicked");
            Disposition::Requeued(queue.enqueue_rate_limited(key.clone()))
        }
    };
    queue.done(&key);
    counter!("keel_reconcile_total", 1u64, "controller" => name, "result" => disposition.label());
    disposition
}

async fn on_error<R>(queue: &WorkQueue, reconciler: &R, key: &ResourceKey, err: ReconcileError) -> Disposition
where
    R: Reconciler + ?Sized,
{
    let name = reconciler.name();
    let class = err.class();
    if class == ErrorClass::Conflict {
        let delay = queue.enqueue_retry(key.clone());
        debug!(controller = name, %key, delay_ms = delay.as_millis() as u64, error = %err, "conflict; retrying");
        return Disposition::Retried(delay);
    }

    // Only permanent errors count toward the ceiling; transient ones back off forever.
    if class == ErrorClass::Permanent {
        let failures = queue.record_failure(key);
        if let Some(max) = queue.max_attempts() {
            if failures >= max {
                error!(controller = name, %key, failures, error = %err, "giving up on key");
                counter!("keel_reconcile_dropped_total", 1u64, "controller" => name.to_string());
                queue.forget(key);
                reconciler.give_up(key, &err).await;
                return Disposition::Dropped;
            }
        }
    }
    let delay = queue.enqueue_rate_limited(key.clone());
    warn!(
        controller = name,
        %key,
        failures = queue.failures(key),
        error_class = ?class,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "reconcile failed"
    );
    Disposition::Requeued(delay)
}
