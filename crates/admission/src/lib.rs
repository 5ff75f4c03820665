//! Keel admission: decisions for pod admission reviews.
//!
//! `validate` requires pods to carry the `appid` label; `mutate` injects a
//! fixed init container. Transport (HTTPS serving, TLS) is left to the caller.

#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

mod review;

pub use review::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, GroupVersionResource, Operation, PatchOperation, PatchType,
    Status, ADMISSION_API_VERSION, ADMISSION_KIND,
};

pub const REQUIRED_LABEL: &str = "appid";

/// Malformed reviews. Callers answer these with HTTP 400.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission review has no request")]
    MissingRequest,
    #[error("did not receive pod, got {}", .0.resource)]
    UnexpectedResource(GroupVersionResource),
    #[error("admission request has no object")]
    MissingObject,
    #[error("error decoding raw pod: {0}")]
    DecodeObject(#[source] serde_json::Error),
    #[error("error encoding patch: {0}")]
    EncodePatch(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct ObjectHeader {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// The request, its pod metadata, after checking it is a core/v1 pod.
fn pod_request(review: &AdmissionReview) -> Result<(&AdmissionRequest, ObjectMeta), AdmissionError> {
    let req = review.request.as_ref().ok_or(AdmissionError::MissingRequest)?;
    if req.resource != GroupVersionResource::pods() {
        return Err(AdmissionError::UnexpectedResource(req.resource.clone()));
    }
    let raw = req.object.clone().ok_or(AdmissionError::MissingObject)?;
    let header: ObjectHeader = serde_json::from_value(raw).map_err(AdmissionError::DecodeObject)?;
    info!(
        uid = %req.uid,
        operation = ?req.operation,
        ns = header.metadata.namespace.as_deref().or(req.namespace.as_deref()).unwrap_or(""),
        name = header.metadata.name.as_deref().or(req.name.as_deref()).unwrap_or(""),
        "admission request"
    );
    Ok((req, header.metadata))
}

fn record(hook: &'static str, allowed: bool) {
    counter!("keel_admission_total", 1u64, "hook" => hook, "allowed" => if allowed { "true" } else { "false" });
}

/// Deny pods that lack the required label.
pub fn validate(review: &AdmissionReview) -> Result<AdmissionReview, AdmissionError> {
    let (req, meta) = pod_request(review)?;
    let labelled = meta.labels.as_ref().is_some_and(|l| l.contains_key(REQUIRED_LABEL));
    let response = if labelled {
        AdmissionResponse::allow(&req.uid)
    } else {
        debug!(uid = %req.uid, "pod missing required label");
        AdmissionResponse::deny(&req.uid, format!("Pod must have the {:?} label!", REQUIRED_LABEL))
    };
    record("validate", response.allowed);
    Ok(review.reply(response))
}

/// The patch `mutate` applies to every pod.
pub fn init_container_patch() -> Vec<PatchOperation> {
    vec![PatchOperation::Add {
        path: "/spec/initContainers".into(),
        value: json!([{
            "name": "init-container",
            "image": "busybox",
            "command": ["sleep", "120"],
        }]),
    }]
}

/// Allow the pod and attach the init-container patch.
pub fn mutate(review: &AdmissionReview) -> Result<AdmissionReview, AdmissionError> {
    let (req, _) = pod_request(review)?;
    let patch = serde_json::to_vec(&init_container_patch()).map_err(AdmissionError::EncodePatch)?;
    let response = AdmissionResponse {
        patch_type: Some(PatchType::JsonPatch),
        patch: Some(STANDARD.encode(patch)),
        ..AdmissionResponse::allow(&req.uid)
    };
    record("mutate", true);
    Ok(review.reply(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn review(resource: &str, labels: Value) -> AdmissionReview {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": resource},
                "namespace": "default",
                "operation": "CREATE",
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default", "labels": labels},
                    "spec": {"containers": [{"name": "web", "image": "nginx"}]}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn labelled_pod_is_allowed() {
        let out = validate(&review("pods", json!({"appid": "shop"}))).unwrap();
        let resp = out.response.unwrap();
        assert!(resp.allowed);
        assert_eq!(resp.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(resp.status.is_none());
        assert_eq!(out.api_version, ADMISSION_API_VERSION);
        assert!(out.request.is_none());
    }

    #[test]
    fn unlabelled_pod_is_denied_with_message() {
        let out = validate(&review("pods", json!({"app": "web"}))).unwrap();
        let resp = out.response.unwrap();
        assert!(!resp.allowed);
        assert_eq!(resp.status.unwrap().message, r#"Pod must have the "appid" label!"#);
    }

    #[test]
    fn non_pod_resources_are_rejected() {
        let err = validate(&review("deployments", json!({}))).unwrap_err();
        assert!(matches!(err, AdmissionError::UnexpectedResource(ref gvr) if gvr.resource == "deployments"));
        assert_eq!(err.to_string(), "did not receive pod, got deployments");
        assert!(mutate(&review("services", json!({}))).is_err());
    }

    #[test]
    fn missing_request_is_an_error() {
        let empty: AdmissionReview = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(validate(&empty), Err(AdmissionError::MissingRequest)));
    }

    #[test]
    fn mutate_adds_init_container_patch() {
        let out = mutate(&review("pods", json!({}))).unwrap();
        let resp = out.response.clone().unwrap();
        assert!(resp.allowed);
        assert_eq!(resp.patch_type, Some(PatchType::JsonPatch));

        let raw = STANDARD.decode(resp.patch.unwrap()).unwrap();
        let patch: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            patch,
            json!([{
                "op": "add",
                "path": "/spec/initContainers",
                "value": [{"name": "init-container", "image": "busybox", "command": ["sleep", "120"]}]
            }])
        );

        let wire = serde_json::to_value(&out).unwrap();
        assert_eq!(wire["response"]["patchType"], "JSONPatch");
    }

    #[test]
    fn operations_parse_from_uppercase() {
        let ops: Vec<Operation> = serde_json::from_str(r#"["CREATE","UPDATE","DELETE","CONNECT"]"#).unwrap();
        assert_eq!(ops, vec![Operation::Create, Operation::Update, Operation::Delete, Operation::Connect]);
        assert!(serde_json::from_str::<Operation>(r#""PATCH""#).is_err());
    }
}
