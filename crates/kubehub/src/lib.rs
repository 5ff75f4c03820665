//! Keel kubehub: client bootstrap and list+watch subscription wiring.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config, Resource, ResourceExt,
};
use keel_core::{ChangeEvent, ResourceKey};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod remote;

pub use remote::{map_kube_error, KubeStore, ObjectStore};

/// Build a client from an explicit kubeconfig path, or infer one
/// (in-cluster service account first, then `KUBECONFIG` / `~/.kube/config`).
pub async fn get_kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig at {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig context")?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    info!(cluster_url = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

/// Namespace and label scope of a subscription.
#[derive(Debug, Clone, Default)]
pub struct WatchScope {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

impl WatchScope {
    pub fn watcher_config(&self) -> watcher::Config {
        let cfg = watcher::Config::default();
        match self.label_selector.as_deref() {
            Some(sel) if !sel.is_empty() => cfg.labels(sel),
            _ => cfg,
        }
    }

    pub fn list_params(&self) -> ListParams {
        let lp = ListParams::default().limit(1);
        match self.label_selector.as_deref() {
            Some(sel) if !sel.is_empty() => lp.labels(sel),
            _ => lp,
        }
    }
}

/// Api handle for a namespaced kind honoring the scope's namespace.
pub fn scoped_api<K>(client: Client, scope: &WatchScope) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match scope.namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Derive the queue key of an object.
pub fn key_of<K: Resource>(obj: &K) -> ResourceKey {
    ResourceKey::new(obj.meta().namespace.as_deref(), &obj.name_any())
}

/// Key of the controlling owner of `obj` when that owner is of `owner_kind`.
pub fn controller_owner_key<K: Resource>(obj: &K, owner_kind: &str) -> Option<ResourceKey> {
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == owner_kind)
        .map(|o| ResourceKey::new(obj.meta().namespace.as_deref(), &o.name))
}

/// Check the store is reachable and the kind is served. Failure here is fatal at startup.
pub async fn probe<K>(api: &Api<K>, scope: &WatchScope) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let kind = K::kind(&());
    api.list(&scope.list_params())
        .await
        .with_context(|| format!("listing {} (is the API server reachable and the kind installed?)", kind))?;
    debug!(%kind, "probe ok");
    Ok(())
}

/// Translate a raw watcher event into a change event.
pub fn translate<K>(ev: Event<K>) -> ChangeEvent<K> {
    match ev {
        Event::Applied(o) => ChangeEvent::Applied(o),
        Event::Deleted(o) => ChangeEvent::Deleted(o),
        Event::Restarted(list) => ChangeEvent::Restarted(list),
    }
}

/// Run list+watch for one kind and forward change events into `tx` until cancelled.
///
/// Connection loss is handled by the watcher: after backoff it relists and emits a
/// `Restarted` event carrying the full listing, which downstream treats as a resync.
pub async fn start_watcher<K>(
    api: Api<K>,
    cfg: watcher::Config,
    tx: mpsc::Sender<ChangeEvent<K>>,
    cancel: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(%kind, "watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                info!(%kind, "watcher cancelled");
                return;
            }
            next = stream.next() => next,
        };
        let Some(item) = next else { break };
        match item {
            Ok(ev) => {
                let ev = translate(ev);
                if let ChangeEvent::Restarted(list) = &ev {
                    debug!(%kind, count = list.len(), "watch restart");
                    counter!("keel_watch_restarts_total", 1u64, "kind" => kind.clone());
                }
                counter!("keel_watch_events_total", 1u64, "kind" => kind.clone(), "event" => ev.kind());
                if tx.send(ev).await.is_err() {
                    debug!(%kind, "event receiver dropped; stopping watcher");
                    return;
                }
            }
            Err(e) => {
                counter!("keel_watch_errors_total", 1u64, "kind" => kind.clone());
                warn!(%kind, error = %e, "watch error; relisting after backoff");
            }
        }
    }
    warn!(%kind, "watcher stream ended");
}
