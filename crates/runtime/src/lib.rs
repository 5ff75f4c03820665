//! Keel runtime: the reconciliation control loop.
//!
//! Data flow: watcher → `ingest` (cache + queue) → `driver` workers →
//! `Reconciler` → queue (forget / requeue).

#![forbid(unsafe_code)]

use async_trait::async_trait;
use keel_core::{ReconcileError, ReconcileOutcome, ResourceKey};

mod controller;
pub mod driver;
pub mod ingest;

pub use controller::{Controller, ControllerConfig};
pub use driver::{process, run_workers, Disposition};
pub use ingest::{apply_event, run_ingest, run_trigger};

/// Level-triggered reconciliation policy for one kind.
///
/// Implementations are stateless between calls: everything they need is read
/// from the cache or the remote store on each pass.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &str;

    /// Drive `key` one step toward its target. At most one remote mutation per call.
    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError>;

    /// Called once when `key` is dropped after its permanent failures reach the attempt ceiling.
    async fn give_up(&self, _key: &ResourceKey, _error: &ReconcileError) {}
}
