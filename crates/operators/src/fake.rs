//! In-memory `ObjectStore` for reconciler scenarios.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::{ResourceKey, StoreError};
use keel_kubehub::{key_of, ObjectStore};
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create(ResourceKey),
    Patch(ResourceKey, Json),
    PatchStatus(ResourceKey, Json),
    Delete(ResourceKey),
}

struct State<K> {
    objects: BTreeMap<ResourceKey, K>,
    calls: Vec<Call>,
    next_rv: u64,
}

pub struct FakeStore<K> {
    state: Mutex<State<K>>,
}

impl<K> FakeStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self { state: Mutex::new(State { objects: BTreeMap::new(), calls: Vec::new(), next_rv: 100 }) }
    }

    /// Seed an object without recording a call. Assigns a fresh resourceVersion.
    pub fn seed(&self, mut obj: K) -> K {
        let mut st = self.state.lock().unwrap();
        st.next_rv += 1;
        obj.meta_mut().resource_version = Some(st.next_rv.to_string());
        st.objects.insert(key_of(&obj), obj.clone());
        obj
    }

    pub fn object(&self, key: &ResourceKey) -> Option<K> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }
}

fn merge(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Default::default());
    }
    let t = target.as_object_mut().unwrap();
    for (k, v) in p {
        if v.is_null() {
            t.remove(k);
        } else {
            merge(t.entry(k.clone()).or_insert(Json::Null), v);
        }
    }
}

impl<K> FakeStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    fn apply(&self, key: &ResourceKey, patch: &Json, call: Call) -> Result<K, StoreError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(call);
        let Some(cur) = st.objects.get(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let expected = patch.pointer("/metadata/resourceVersion").and_then(Json::as_str);
        if let Some(expected) = expected {
            if cur.meta().resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict { key: key.clone(), message: "resourceVersion mismatch".into() });
            }
        }
        let mut doc = serde_json::to_value(cur).unwrap();
        merge(&mut doc, patch);
        let mut next: K = serde_json::from_value(doc)
            .map_err(|e| StoreError::Invalid { key: key.clone(), message: e.to_string() })?;
        st.next_rv += 1;
        next.meta_mut().resource_version = Some(st.next_rv.to_string());
        st.objects.insert(key.clone(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for FakeStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ResourceKey) -> Result<Option<K>, StoreError> {
        Ok(self.object(key))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj);
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::Create(key.clone()));
        if st.objects.contains_key(&key) {
            return Err(StoreError::Conflict { key, message: "already exists".into() });
        }
        st.next_rv += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(st.next_rv.to_string());
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch(&self, key: &ResourceKey, patch: &Json) -> Result<K, StoreError> {
        self.apply(key, patch, Call::Patch(key.clone(), patch.clone()))
    }

    async fn patch_status(&self, key: &ResourceKey, patch: &Json) -> Result<K, StoreError> {
        self.apply(key, patch, Call::PatchStatus(key.clone(), patch.clone()))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(Call::Delete(key.clone()));
        st.objects.remove(key);
        Ok(())
    }
}
