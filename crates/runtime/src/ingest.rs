//! Consumers of the change-event channel: cache updater + enqueue step.

use std::sync::Arc;

use keel_core::{ChangeEvent, ResourceKey};
use keel_kubehub::key_of;
use keel_queue::WorkQueue;
use keel_store::ResourceCache;
use kube::Resource;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Apply one change event to the cache and schedule the affected keys.
pub fn apply_event<K>(cache: &ResourceCache<K>, queue: &WorkQueue, ev: ChangeEvent<K>)
where
    K: Resource<DynamicType = ()>,
{
    match ev {
        ChangeEvent::Applied(obj) => {
            let key = cache.upsert(obj);
            queue.enqueue(key);
        }
        ChangeEvent::Deleted(obj) => {
            let key = key_of(&obj);
            cache.delete(&key);
            // reconcile the absence so derived objects get cleaned up
            queue.enqueue(key);
        }
        ChangeEvent::Restarted(list) => {
            let listed = list.len();
            let changed = cache.replace_all(list);
            info!(queue = queue.name(), listed, requeued = changed.len(), "resync applied");
            for key in changed {
                queue.enqueue(key);
            }
            cache.mark_synced();
        }
    }
}

/// Drain `rx` into the cache and queue until the sender side closes.
pub async fn run_ingest<K>(mut rx: mpsc::Receiver<ChangeEvent<K>>, cache: Arc<ResourceCache<K>>, queue: WorkQueue)
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    while let Some(ev) = rx.recv().await {
        apply_event(&cache, &queue, ev);
    }
    debug!(queue = queue.name(), "event channel closed; ingest loop stopped");
}

/// Enqueue keys mapped from events of a secondary kind (e.g. owned objects).
/// Does not touch the primary cache.
pub async fn run_trigger<K, F>(mut rx: mpsc::Receiver<ChangeEvent<K>>, queue: WorkQueue, map: F)
where
    K: Send + 'static,
    F: Fn(&K) -> Option<ResourceKey> + Send + 'static,
{
    while let Some(ev) = rx.recv().await {
        match ev {
            ChangeEvent::Applied(obj) | ChangeEvent::Deleted(obj) => {
                if let Some(key) = map(&obj) {
                    queue.enqueue(key);
                }
            }
            ChangeEvent::Restarted(list) => {
                for key in list.iter().filter_map(&map) {
                    queue.enqueue(key);
                }
            }
        }
    }
    debug!(queue = queue.name(), "trigger channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_queue::RateLimitConfig;

    fn deploy(name: &str, rv: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn deleted_event_removes_and_enqueues_once() {
        let cache = ResourceCache::<Deployment>::new();
        let queue = WorkQueue::new("ingest", &RateLimitConfig::default());
        apply_event(&cache, &queue, ChangeEvent::Applied(deploy("a", "1")));
        let k = queue.get().await.unwrap();
        queue.done(&k);

        apply_event(&cache, &queue, ChangeEvent::Deleted(deploy("a", "1")));
        assert!(cache.get(&k).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn restart_marks_synced() {
        let cache = ResourceCache::<Deployment>::new();
        let queue = WorkQueue::new("ingest", &RateLimitConfig::default());
        assert!(!cache.has_synced());
        apply_event(&cache, &queue, ChangeEvent::Restarted(vec![deploy("a", "1")]));
        assert!(cache.has_synced());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn trigger_maps_events_to_owner_keys() {
        let queue = WorkQueue::new("trigger", &RateLimitConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run_trigger(rx, queue.clone(), |d: &Deployment| {
            d.metadata.name.as_deref().filter(|n| n.starts_with("web")).map(|_| ResourceKey::namespaced("ns", "owner"))
        }));
        tx.send(ChangeEvent::Applied(deploy("web-1", "1"))).await.unwrap();
        tx.send(ChangeEvent::Applied(deploy("other", "1"))).await.unwrap();
        tx.send(ChangeEvent::Restarted(vec![deploy("web-2", "1")])).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(ResourceKey::namespaced("ns", "owner")));
    }
}
