//! Remote store seam used by reconcilers: typed get/create/patch/delete.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use keel_core::{ResourceKey, StoreError};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tracing::debug;

const FIELD_MANAGER: &str = "keel";

/// Read-through and write operations against the authoritative store.
///
/// `get` maps a missing object to `Ok(None)`; `delete` of a missing object succeeds.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<K>, StoreError>;
    async fn create(&self, obj: &K) -> Result<K, StoreError>;
    /// JSON merge patch of the main resource.
    async fn patch(&self, key: &ResourceKey, patch: &Json) -> Result<K, StoreError>;
    /// JSON merge patch of the status subresource.
    async fn patch_status(&self, key: &ResourceKey, patch: &Json) -> Result<K, StoreError>;
    async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError>;
}

/// Translate a kube client error into the store taxonomy.
pub fn map_kube_error(key: &ResourceKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(resp) if resp.code == 409 => {
            StoreError::Conflict { key: key.clone(), message: resp.message }
        }
        kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => {
            StoreError::Invalid { key: key.clone(), message: resp.message }
        }
        other => StoreError::Transient(other.into()),
    }
}

/// `ObjectStore` backed by the kube API for a namespaced kind.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), _kind: PhantomData }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn new(client: Client) -> Self {
        Self { client, _kind: PhantomData }
    }

    fn api(&self, key: &ResourceKey) -> Result<Api<K>, StoreError> {
        match key.namespace() {
            Some(ns) => Ok(Api::namespaced(self.client.clone(), ns)),
            None => Err(StoreError::Invalid {
                key: key.clone(),
                message: format!("{} is namespaced; key has no namespace", K::kind(&())),
            }),
        }
    }

    fn params() -> PatchParams {
        PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ResourceKey) -> Result<Option<K>, StoreError> {
        self.api(key)?.get_opt(&key.name).await.map_err(|e| map_kube_error(key, e))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = crate::key_of(obj);
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        self.api(&key)?.create(&pp, obj).await.map_err(|e| map_kube_error(&key, e))
    }

    async fn patch(&self, key: &ResourceKey, patch: &Json) -> Result<K, StoreError> {
        self.api(key)?
            .patch(&key.name, &Self::params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error(key, e))
    }

    async fn patch_status(&self, key: &ResourceKey, patch: &Json) -> Result<K, StoreError> {
        self.api(key)?
            .patch_status(&key.name, &Self::params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error(key, e))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        match self.api(key)?.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(%key, "delete: already gone");
                Ok(())
            }
            Err(e) => Err(map_kube_error(key, e)),
        }
    }
}
