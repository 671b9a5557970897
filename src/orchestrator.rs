use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Config, Event};
use kube::{Api, Client};
use tracing::{info, warn};

use crate::error::ControlPlaneError;
use crate::sandbox::{
    Sandbox, SandboxSpec, ANNOTATION_ALLOCATED_AT, ANNOTATION_CREATED_AT,
    ANNOTATION_LAST_ACTIVITY_AT, LABEL_KIND, LABEL_POOL_STATUS, LABEL_POOL_USER,
};

/// A labels/annotations delta to apply via a strategic-merge patch. `None`
/// values are left untouched; this is never used to delete a key (the
/// control plane never needs to, per the data model).
#[derive(Debug, Clone, Default)]
pub struct LabelAnnotationDelta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Thin wrapper over the orchestrator's pod API. Everything C3/C4/C5 do to
/// mutate or observe sandbox state goes through here so it can be swapped
/// for a fake in tests.
#[derive(Clone)]
pub struct OrchestratorAdapter {
    pods: Api<Pod>,
    namespace: String,
}

impl OrchestratorAdapter {
    pub fn new(client: Client, namespace: &str) -> Self {
        OrchestratorAdapter {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub async fn create_sandbox(
        &self,
        name: &str,
        spec: &SandboxSpec,
        pool_status_label: &str,
        user_id: Option<&str>,
    ) -> Result<Sandbox, ControlPlaneError> {
        let mut labels = spec.labels.clone();
        labels.insert(LABEL_POOL_STATUS.to_string(), pool_status_label.to_string());
        labels.insert(LABEL_KIND.to_string(), spec.kind.as_label_value().to_string());
        if let Some(u) = user_id {
            labels.insert(LABEL_POOL_USER.to_string(), u.to_string());
        }

        let now = Utc::now().to_rfc3339();
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_CREATED_AT.to_string(), now.clone());
        if user_id.is_some() {
            annotations.insert(ANNOTATION_ALLOCATED_AT.to_string(), now.clone());
            annotations.insert(ANNOTATION_LAST_ACTIVITY_AT.to_string(), now);
        }

        let env: Vec<_> = spec
            .env
            .iter()
            .map(|(k, v)| k8s_openapi::api::core::v1::EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        let resources = ResourceRequirements {
            requests: Some(
                [
                    spec.resources
                        .cpu_request
                        .as_ref()
                        .map(|v| ("cpu".to_string(), Quantity(v.clone()))),
                    spec.resources
                        .memory_request
                        .as_ref()
                        .map(|v| ("memory".to_string(), Quantity(v.clone()))),
                ]
                .into_iter()
                .flatten()
                .collect(),
            ),
            limits: Some(
                [
                    spec.resources
                        .cpu_limit
                        .as_ref()
                        .map(|v| ("cpu".to_string(), Quantity(v.clone()))),
                    spec.resources
                        .memory_limit
                        .as_ref()
                        .map(|v| ("memory".to_string(), Quantity(v.clone()))),
                ]
                .into_iter()
                .flatten()
                .collect(),
            ),
            ..Default::default()
        };

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "sandbox".to_string(),
                    image: Some(spec.image.clone()),
                    env: Some(env),
                    resources: Some(resources),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            status: None,
        };

        let created = self
            .pods
            .create(&Default::default(), &pod)
            .await
            .map_err(ControlPlaneError::from)?;
        Sandbox::from_pod(&created)
            .ok_or_else(|| ControlPlaneError::Fatal("created pod missing pool labels".into()))
    }

    pub async fn get_sandbox(&self, name: &str) -> Result<Option<Sandbox>, ControlPlaneError> {
        match self.pods.get(name).await {
            Ok(pod) => Ok(Sandbox::from_pod(&pod)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_sandboxes(&self, selector: &str) -> Result<Vec<Sandbox>, ControlPlaneError> {
        let lp = ListParams::default().labels(selector);
        let list = self.pods.list(&lp).await.map_err(ControlPlaneError::from)?;
        Ok(list.items.iter().filter_map(Sandbox::from_pod).collect())
    }

    /// Deletion is idempotent: a missing sandbox is treated as success.
    pub async fn delete_sandbox(&self, name: &str) -> Result<(), ControlPlaneError> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies a labels/annotations delta as a compare-and-set against the
    /// observed resource version. A `409` from the API server is surfaced
    /// as `ControlPlaneError::Conflict` so callers (chiefly the pool
    /// manager's allocator) can move on to the next candidate.
    pub async fn patch_labels_annotations(
        &self,
        name: &str,
        resource_version: &str,
        delta: &LabelAnnotationDelta,
    ) -> Result<Sandbox, ControlPlaneError> {
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "resourceVersion": resource_version,
                "labels": delta.labels,
                "annotations": delta.annotations,
            }
        });

        let result = self
            .pods
            .patch(name, &PatchParams::apply("sandboxd"), &Patch::Apply(&patch))
            .await;

        match result {
            Ok(pod) => Sandbox::from_pod(&pod)
                .ok_or_else(|| ControlPlaneError::Fatal("patched pod missing pool labels".into())),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(ControlPlaneError::Conflict(e.message))
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(ControlPlaneError::NotFound(e.message))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lazily streams add/modify/delete/restart events for sandboxes
    /// matching `selector`. Used by the watch role to drive C4 without a
    /// synchronous poll loop.
    pub fn watch_sandboxes(
        &self,
        selector: &str,
    ) -> impl futures::Stream<Item = Result<Event<Pod>, watcher::Error>> {
        let cfg = Config::default().labels(selector);
        watcher::watcher(self.pods.clone(), cfg)
    }
}

/// Checks that the connected orchestrator is reachable and that the
/// credentials in use can list, create, patch and delete sandbox pods, plus
/// read/write leases. Mirrors the `check` command's progressive-probe style.
pub async fn check_connectivity(client: Client, namespace: &str) -> anyhow::Result<()> {
    use k8s_openapi::api::coordination::v1::Lease;

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    print!("Checking pod list permission... ");
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAIL ({e})");
            anyhow::bail!("cannot list pods in namespace {namespace}");
        }
    }

    let leases: Api<Lease> = Api::namespaced(client, namespace);
    print!("Checking lease list permission... ");
    match leases.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            println!("OK");
            info!(namespace, "connectivity_check_passed");
            Ok(())
        }
        Err(e) => {
            println!("FAIL ({e})");
            warn!(namespace, error = %e, "connectivity_check_failed");
            anyhow::bail!("cannot list leases in namespace {namespace}");
        }
    }
}
