//! Keel store: local resource cache kept fresh by the change subscription.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use keel_core::ResourceKey;
use keel_kubehub::key_of;
use kube::Resource;
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

/// Last-known remote representation of one resource.
#[derive(Debug)]
pub struct ObservedResource<K> {
    pub key: ResourceKey,
    /// Staleness token (`metadata.resourceVersion`).
    pub resource_version: Option<String>,
    pub object: K,
}

impl<K: Resource> ObservedResource<K> {
    fn from_object(object: K) -> Self {
        Self {
            key: key_of(&object),
            resource_version: object.meta().resource_version.clone(),
            object,
        }
    }

    /// Whether `other` describes a different remote state than `self`.
    /// Objects without a version token always count as changed.
    fn differs_from(&self, other: &ObservedResource<K>) -> bool {
        match (&self.resource_version, &other.resource_version) {
            (Some(a), Some(b)) => a != b,
            _ => true,
        }
    }
}

type Index<K> = FxHashMap<ResourceKey, Arc<ObservedResource<K>>>;

/// Keyed mirror of remote state.
///
/// Readers load an immutable snapshot without locking; writers swap in a
/// modified copy. Entries are replaced wholesale, last writer by arrival wins.
pub struct ResourceCache<K> {
    snap: ArcSwap<Index<K>>,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

impl<K: Resource<DynamicType = ()>> Default for ResourceCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource<DynamicType = ()>> ResourceCache<K> {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (synced_tx, _) = watch::channel(false);
        Self { snap: ArcSwap::from_pointee(Index::default()), epoch_tx, synced_tx }
    }

    /// Insert or replace the entry for the object's key. Returns the key.
    pub fn upsert(&self, object: K) -> ResourceKey {
        let entry = Arc::new(ObservedResource::from_object(object));
        let key = entry.key.clone();
        self.snap.rcu(|cur| {
            let mut next = Index::clone(cur);
            next.insert(key.clone(), Arc::clone(&entry));
            next
        });
        self.bump();
        key
    }

    /// Remove the entry for `key`, returning what was cached.
    pub fn delete(&self, key: &ResourceKey) -> Option<Arc<ObservedResource<K>>> {
        let prev = self.snap.load().get(key).cloned()?;
        self.snap.rcu(|cur| {
            let mut next = Index::clone(cur);
            next.remove(key);
            next
        });
        self.bump();
        Some(prev)
    }

    /// `None` means "not currently tracked"; callers treat it as possibly deleted remotely.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<ObservedResource<K>>> {
        self.snap.load().get(key).cloned()
    }

    /// All cached entries ordered by key.
    pub fn list_all(&self) -> Vec<Arc<ObservedResource<K>>> {
        let snap = self.snap.load();
        let mut out: Vec<_> = snap.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the cache from a fresh full listing.
    ///
    /// Returns, sorted, the keys that are new, whose version token changed, or
    /// that are no longer listed.
    pub fn replace_all(&self, listing: Vec<K>) -> Vec<ResourceKey> {
        let fresh: Index<K> = listing
            .into_iter()
            .map(|o| {
                let entry = ObservedResource::from_object(o);
                (entry.key.clone(), Arc::new(entry))
            })
            .collect();
        let prev = self.snap.swap(Arc::new(fresh));
        let next = self.snap.load();

        let mut changed: Vec<ResourceKey> = next
            .iter()
            .filter(|(k, v)| prev.get(*k).map(|old| old.differs_from(v)).unwrap_or(true))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(prev.keys().filter(|k| !next.contains_key(*k)).cloned());
        changed.sort();
        debug!(total = next.len(), changed = changed.len(), "cache resynced");
        self.bump();
        changed
    }

    /// Mutation counter, incremented on every write.
    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Record that the first full listing has been applied.
    pub fn mark_synced(&self) {
        self.synced_tx.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Wait until `mark_synced` has been called.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced_tx.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn bump(&self) {
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
        gauge!("keel_cache_objects", self.len() as f64, "kind" => K::kind(&()).to_string());
    }
}
