use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use k8s_openapi::NamespaceResourceScope;
use keel_kubehub::{controller_owner_key, probe, scoped_api, start_watcher, WatchScope};
use keel_queue::{RateLimitConfig, WorkQueue};
use keel_store::ResourceCache;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::run_workers;
use crate::ingest::{run_ingest, run_trigger};
use crate::Reconciler;

/// Runtime knobs of one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub scope: WatchScope,
    pub workers: usize,
    pub rate_limit: RateLimitConfig,
    /// Bound of the watcher → ingest channel.
    pub channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { scope: WatchScope::default(), workers: 2, rate_limit: RateLimitConfig::default(), channel_capacity: 2048 }
    }
}

type Trigger = Box<dyn FnOnce(WorkQueue, CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// Wires a watcher, the cache, the work queue and a reconciler for kind `K`.
pub struct Controller<K> {
    client: Client,
    config: ControllerConfig,
    cache: Arc<ResourceCache<K>>,
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue,
    triggers: Vec<Trigger>,
}

impl<K> Controller<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    /// `cache` is shared with the reconciler, which reads primary objects from it.
    pub fn new(
        client: Client,
        config: ControllerConfig,
        cache: Arc<ResourceCache<K>>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        let queue = WorkQueue::new(reconciler.name(), &config.rate_limit);
        Self { client, config, cache, reconciler, queue, triggers: Vec::new() }
    }

    /// Also watch `C` objects and reconcile the `K` that controls them.
    pub fn owns<C>(mut self) -> Self
    where
        C: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let client = self.client.clone();
        let scope = WatchScope { namespace: self.config.scope.namespace.clone(), label_selector: None };
        let capacity = self.config.channel_capacity.max(1);
        let owner_kind = K::kind(&()).to_string();
        self.triggers.push(Box::new(move |queue, cancel| {
            async move {
                let api = scoped_api::<C>(client, &scope);
                let (tx, rx) = mpsc::channel(capacity);
                let watch = tokio::spawn(start_watcher(api, scope.watcher_config(), tx, cancel));
                run_trigger(rx, queue, move |obj: &C| controller_owner_key(obj, &owner_kind)).await;
                if let Err(e) = watch.await {
                    warn!(error = %e, "owned-object watcher task failed");
                }
            }
            .boxed()
        }));
        self
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<ResourceCache<K>> {
        &self.cache
    }

    /// Run until `shutdown` fires. Only the startup probe can fail.
    ///
    /// Workers start after the first full listing is in the cache. On shutdown
    /// the watchers stop, the queue refuses new keys, and in-flight passes finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Controller { client, config, cache, reconciler, queue, triggers } = self;
        let kind = K::kind(&()).to_string();
        let api = scoped_api::<K>(client, &config.scope);
        probe(&api, &config.scope).await?;

        let watch_cancel = shutdown.child_token();
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let mut tasks = JoinSet::new();
        tasks.spawn(start_watcher(api, config.scope.watcher_config(), tx, watch_cancel.clone()));
        tasks.spawn(run_ingest(rx, Arc::clone(&cache), queue.clone()));
        for trigger in triggers {
            tasks.spawn(trigger(queue.clone(), watch_cancel.clone()));
        }

        info!(controller = reconciler.name(), %kind, ns = ?config.scope.namespace, "waiting for initial sync");
        let synced = tokio::select! {
            _ = cache.wait_synced() => true,
            _ = shutdown.cancelled() => false,
        };
        if synced {
            info!(controller = reconciler.name(), objects = cache.len(), "cache synced; starting workers");
            tasks.spawn(run_workers(queue.clone(), Arc::clone(&reconciler), config.workers));
            shutdown.cancelled().await;
        }

        info!(controller = reconciler.name(), "shutting down");
        watch_cancel.cancel();
        queue.shutdown();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "controller task failed");
            }
        }
        info!(controller = reconciler.name(), "stopped");
        Ok(())
    }
}
