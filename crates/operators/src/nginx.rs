//! `Nginx` custom resource → owned Deployment.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use keel_core::{ReconcileError, ReconcileOutcome, ResourceKey, StoreError};
use keel_kubehub::{controller_owner_key, ObjectStore};
use keel_runtime::Reconciler;
use keel_store::ResourceCache;
use kube::{Resource, ResourceExt};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::crd::{Nginx, NginxSpec};

/// Reject specs the Deployment could never satisfy.
pub fn validate_spec(key: &ResourceKey, spec: &NginxSpec) -> Result<(), ReconcileError> {
    if spec.replicas < 0 {
        return Err(ReconcileError::invalid_spec(key, format!("replicas must be >= 0, got {}", spec.replicas)));
    }
    if spec.image.trim().is_empty() {
        return Err(ReconcileError::invalid_spec(key, "image must not be empty"));
    }
    if !(1..=65535).contains(&spec.port) {
        return Err(ReconcileError::invalid_spec(key, format!("port must be in 1..=65535, got {}", spec.port)));
    }
    Ok(())
}

/// The Deployment an `Nginx` resource should own.
pub fn new_deployment(nginx: &Nginx) -> Result<Deployment, ReconcileError> {
    let name = nginx.name_any();
    let owner = nginx
        .controller_owner_ref(&())
        .ok_or_else(|| ReconcileError::invalid_spec(&keel_kubehub::key_of(nginx), "resource has no uid yet"))?;
    let labels = BTreeMap::from([("app".to_string(), name.clone())]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: nginx.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(nginx.spec.replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".into(),
                        image: Some(nginx.spec.image.clone()),
                        ports: Some(vec![ContainerPort { container_port: nginx.spec.port, ..Default::default() }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn action(name: &'static str) {
    counter!("keel_nginx_actions_total", 1u64, "action" => name);
}

/// Keeps one Deployment per `Nginx` resource: created, scaled, and removed with it.
pub struct NginxReconciler {
    cache: Arc<ResourceCache<Nginx>>,
    deployments: Arc<dyn ObjectStore<Deployment>>,
    nginxes: Arc<dyn ObjectStore<Nginx>>,
}

impl NginxReconciler {
    pub fn new(
        cache: Arc<ResourceCache<Nginx>>,
        deployments: Arc<dyn ObjectStore<Deployment>>,
        nginxes: Arc<dyn ObjectStore<Nginx>>,
    ) -> Self {
        Self { cache, deployments, nginxes }
    }

    /// The parent is gone: remove the Deployment it owned, if any.
    async fn cleanup(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(deployment) = self.deployments.get(key).await? else {
            debug!(%key, "no deployment left; done");
            return Ok(ReconcileOutcome::Converged);
        };
        if controller_owner_key(&deployment, &Nginx::kind(&())).as_ref() != Some(key) {
            debug!(%key, "deployment not owned by this resource; leaving it");
            return Ok(ReconcileOutcome::Converged);
        }
        self.deployments.delete(key).await?;
        info!(%key, "deleted deployment of removed resource");
        action("delete");
        Ok(ReconcileOutcome::Requeue)
    }
}

#[async_trait]
impl Reconciler for NginxReconciler {
    fn name(&self) -> &str {
        "nginx"
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(observed) = self.cache.get(key) else {
            return self.cleanup(key).await;
        };
        let nginx = &observed.object;
        validate_spec(key, &nginx.spec)?;

        let Some(deployment) = self.deployments.get(key).await? else {
            let desired = new_deployment(nginx)?;
            self.deployments.create(&desired).await?;
            info!(%key, replicas = nginx.spec.replicas, image = %nginx.spec.image, "created deployment");
            action("create");
            return Ok(ReconcileOutcome::Requeue);
        };

        if controller_owner_key(&deployment, &Nginx::kind(&())).as_ref() != Some(key) {
            warn!(%key, "deployment exists but is controlled by someone else");
            return Err(ReconcileError::NotOwned { key: key.clone() });
        }
        let current = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if current == nginx.spec.replicas {
            return Ok(ReconcileOutcome::Converged);
        }
        let patch = json!({
            "metadata": {"resourceVersion": deployment.resource_version()},
            "spec": {"replicas": nginx.spec.replicas},
        });
        self.deployments.patch(key, &patch).await?;
        info!(%key, from = current, to = nginx.spec.replicas, "corrected replica drift");
        action("scale");
        Ok(ReconcileOutcome::Requeue)
    }

    async fn give_up(&self, key: &ResourceKey, error: &ReconcileError) {
        if self.cache.get(key).is_none() {
            return;
        }
        let patch = json!({
            "status": {
                "phase": "Failed",
                "message": error.to_string(),
                "lastTransitionTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            }
        });
        match self.nginxes.patch_status(key, &patch).await {
            Ok(_) => info!(%key, "marked resource failed"),
            Err(StoreError::NotFound(_)) => debug!(%key, "resource gone before status write"),
            Err(e) => warn!(%key, error = %e, "failed to write status"),
        }
    }
}
