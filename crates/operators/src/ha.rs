//! Annotation-gated minimum-replica policy for Deployments.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use keel_core::{ReconcileError, ReconcileOutcome, ResourceKey};
use keel_kubehub::ObjectStore;
use keel_runtime::Reconciler;
use keel_store::ResourceCache;
use kube::ResourceExt;
use metrics::counter;
use serde_json::json;
use tracing::{debug, info};

pub const DEFAULT_HA_ANNOTATION: &str = "demo-controller.local/ha";

#[derive(Debug, Clone, PartialEq)]
pub struct HaConfig {
    /// Deployments opt in by setting this annotation to `"true"`.
    pub annotation: String,
    pub min_replicas: i32,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self { annotation: DEFAULT_HA_ANNOTATION.to_string(), min_replicas: 2 }
    }
}

/// Scales opted-in single-replica Deployments up to `min_replicas`.
pub struct HaScaler {
    cache: Arc<ResourceCache<Deployment>>,
    store: Arc<dyn ObjectStore<Deployment>>,
    config: HaConfig,
}

impl HaScaler {
    pub fn new(
        cache: Arc<ResourceCache<Deployment>>,
        store: Arc<dyn ObjectStore<Deployment>>,
        config: HaConfig,
    ) -> Self {
        Self { cache, store, config }
    }

    fn opted_in(&self, d: &Deployment) -> bool {
        d.annotations().get(&self.config.annotation).map(String::as_str) == Some("true")
    }

    /// Opted in and still at a single replica below the minimum.
    fn wants_scale(&self, d: &Deployment) -> bool {
        let current = replicas(d);
        self.opted_in(d) && current <= 1 && current < self.config.min_replicas
    }
}

/// Replica count as the API server defaults it.
fn replicas(d: &Deployment) -> i32 {
    d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

#[async_trait]
impl Reconciler for HaScaler {
    fn name(&self) -> &str {
        "ha-scaler"
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(observed) = self.cache.get(key) else {
            debug!(%key, "deployment gone; nothing to do");
            return Ok(ReconcileOutcome::Converged);
        };
        if !self.wants_scale(&observed.object) {
            return Ok(ReconcileOutcome::Converged);
        }
        // The cache can trail our own last write; decide on the live object.
        let Some(live) = self.store.get(key).await? else {
            return Ok(ReconcileOutcome::Converged);
        };
        if !self.wants_scale(&live) {
            debug!(%key, "cache behind the store; live deployment already scaled");
            return Ok(ReconcileOutcome::Converged);
        }

        let current = replicas(&live);
        let target = self.config.min_replicas;
        let patch = json!({
            "metadata": {"resourceVersion": live.resource_version()},
            "spec": {"replicas": target},
        });
        self.store.patch(key, &patch).await?;
        info!(%key, from = current, to = target, "scaled deployment");
        counter!("keel_ha_scaled_total", 1u64);
        Ok(ReconcileOutcome::Requeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{Call, FakeStore};
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_queue::{RateLimitConfig, WorkQueue};
    use keel_runtime::{process, Disposition};
    use std::collections::BTreeMap;

    fn deployment(name: &str, replicas: Option<i32>, ha: Option<&str>) -> Deployment {
        let annotations = ha.map(|v| BTreeMap::from([(DEFAULT_HA_ANNOTATION.to_string(), v.to_string())]));
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                annotations,
                ..Default::default()
            },
            spec: Some(DeploymentSpec { replicas, ..Default::default() }),
            ..Default::default()
        }
    }

    struct Harness {
        cache: Arc<ResourceCache<Deployment>>,
        store: Arc<FakeStore<Deployment>>,
        scaler: HaScaler,
    }

    impl Harness {
        fn new() -> Self {
            let cache = Arc::new(ResourceCache::new());
            let store = Arc::new(FakeStore::new());
            let scaler = HaScaler::new(Arc::clone(&cache), store.clone(), HaConfig::default());
            Self { cache, store, scaler }
        }

        /// Put `d` in the store and deliver it to the cache, as the watcher would.
        fn observe(&self, d: Deployment) -> ResourceKey {
            let stored = self.store.seed(d);
            self.cache.upsert(stored)
        }

        /// Deliver the store's current version of `key` to the cache.
        fn sync(&self, key: &ResourceKey) {
            if let Some(d) = self.store.object(key) {
                self.cache.upsert(d);
            }
        }
    }

    #[tokio::test]
    async fn scales_single_replica_to_minimum_then_converges() {
        let h = Harness::new();
        let key = h.observe(deployment("web", Some(1), Some("true")));

        assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Requeue);
        h.sync(&key);
        assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Converged);

        let calls = h.store.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Patch(k, p) if k == &key && p["spec"]["replicas"] == 2));
        assert_eq!(replicas(&h.store.object(&key).unwrap()), 2);
    }

    #[tokio::test]
    async fn missing_replicas_counts_as_one() {
        let h = Harness::new();
        let key = h.observe(deployment("web", None, Some("true")));
        assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Requeue);
        assert_eq!(replicas(&h.store.object(&key).unwrap()), 2);
    }

    #[tokio::test]
    async fn unmarked_deployments_are_left_alone() {
        let h = Harness::new();
        let plain = h.observe(deployment("plain", Some(1), None));
        let off = h.observe(deployment("off", Some(0), Some("false")));
        let big = h.observe(deployment("big", Some(5), Some("true")));
        for key in [plain, off, big] {
            assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Converged);
        }
        assert!(h.store.calls().is_empty());
    }

    #[tokio::test]
    async fn absent_deployment_is_converged() {
        let h = Harness::new();
        let key = ResourceKey::namespaced("default", "ghost");
        assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Converged);
        assert!(h.store.calls().is_empty());
    }

    #[tokio::test]
    async fn trailing_cache_defers_to_live_object() {
        let h = Harness::new();
        let key = h.observe(deployment("web", Some(1), Some("true")));
        // Someone else scales it; the cache has not caught up yet.
        h.store.seed(deployment("web", Some(3), Some("true")));

        assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Converged);
        assert!(h.store.calls().is_empty());
        assert_eq!(replicas(&h.store.object(&key).unwrap()), 3);
    }

    #[tokio::test]
    async fn writes_carry_the_live_resource_version() {
        let h = Harness::new();
        let key = h.observe(deployment("web", Some(1), Some("true")));
        let live = h.store.seed(deployment("web", Some(1), Some("true")));

        assert_eq!(h.scaler.reconcile(&key).await.unwrap(), ReconcileOutcome::Requeue);
        let calls = h.store.calls();
        assert!(matches!(
            &calls[..],
            [Call::Patch(_, p)] if p["metadata"]["resourceVersion"] == json!(live.resource_version())
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn verify_pass_before_watch_catches_up_patches_once() {
        let h = Harness::new();
        let key = h.observe(deployment("web", Some(1), Some("true")));
        let queue = WorkQueue::new("ha", &RateLimitConfig::default());

        let mut seen = Vec::new();
        for _ in 0..10 {
            queue.enqueue(key.clone());
            let k = queue.get().await.unwrap();
            seen.push(process(&queue, &h.scaler, k).await);
        }

        assert!(matches!(seen[0], Disposition::Requeued(_)));
        assert!(seen[1..].iter().all(|d| *d == Disposition::Converged), "{seen:?}");
        let patches = h.store.calls().into_iter().filter(|c| matches!(c, Call::Patch(..))).count();
        assert_eq!(patches, 1);
        assert_eq!(replicas(&h.cache.get(&key).unwrap().object), 1, "cache left stale on purpose");
    }
}
