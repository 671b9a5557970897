use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::error::ControlPlaneError;

pub const LABEL_POOL_STATUS: &str = "sandboxd.io/pool-status";
pub const LABEL_POOL_USER: &str = "sandboxd.io/pool-user";
pub const LABEL_KIND: &str = "sandboxd.io/kind";
pub const ANNOTATION_ALLOCATED_AT: &str = "sandboxd.io/allocated-at";
pub const ANNOTATION_LAST_ACTIVITY_AT: &str = "sandboxd.io/last-activity-at";
pub const ANNOTATION_CREATED_AT: &str = "sandboxd.io/created-at";

/// A sandbox's pool lifecycle phase, as tracked by the control plane
/// (distinct from the orchestrator's own pod `phase`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Creating,
    Warm,
    Allocated,
    Manual,
    Mcp,
}

impl PoolStatus {
    pub fn as_label_value(&self) -> &'static str {
        match self {
            PoolStatus::Creating => "creating",
            PoolStatus::Warm => "warm",
            PoolStatus::Allocated => "allocated",
            PoolStatus::Manual => "manual",
            PoolStatus::Mcp => "mcp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creating" => Some(PoolStatus::Creating),
            "warm" => Some(PoolStatus::Warm),
            "allocated" => Some(PoolStatus::Allocated),
            "manual" => Some(PoolStatus::Manual),
            "mcp" => Some(PoolStatus::Mcp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Executor,
    Mcp,
}

impl SandboxKind {
    pub fn as_label_value(&self) -> &'static str {
        match self {
            SandboxKind::Executor => "executor",
            SandboxKind::Mcp => "mcp",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ObservedPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<Option<&str>> for ObservedPhase {
    fn from(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => ObservedPhase::Pending,
            Some("Running") => ObservedPhase::Running,
            Some("Succeeded") => ObservedPhase::Succeeded,
            Some("Failed") => ObservedPhase::Failed,
            _ => ObservedPhase::Unknown,
        }
    }
}

/// Resource requests/limits set at creation time, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Everything needed to create one sandbox. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub kind: SandboxKind,
    pub image: String,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Validates a spec before it ever reaches the orchestrator. Shared by
/// both the allocate path's on-demand fallback and the direct create
/// path, so there is exactly one place image-name and resource rules
/// are enforced.
pub fn validate_spec(spec: &SandboxSpec) -> Result<(), ControlPlaneError> {
    if spec.image.trim().is_empty() {
        return Err(ControlPlaneError::Validation("image must not be empty".into()));
    }
    if spec.image.len() > 256 {
        return Err(ControlPlaneError::Validation("image name too long".into()));
    }
    if spec.image.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ControlPlaneError::Validation("image name contains invalid characters".into()));
    }
    if let Some(cpu) = &spec.resources.cpu_limit {
        if cpu.trim().is_empty() {
            return Err(ControlPlaneError::Validation("cpu_limit must not be empty when set".into()));
        }
    }
    if let Some(mem) = &spec.resources.memory_limit {
        if mem.trim().is_empty() {
            return Err(ControlPlaneError::Validation("memory_limit must not be empty when set".into()));
        }
    }
    Ok(())
}

/// The projection of a sandbox that is safe to hand to a caller: no
/// internal orchestrator bookkeeping, just identity, status and network
/// location once known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// The control plane's full view of one sandbox: identity, pool state,
/// ownership, timestamps and what the orchestrator currently observes.
///
/// Invariants (see design notes for the full list):
/// - `pool_status` in {Allocated, Manual} implies `user_id` is set and
///   `allocated_at` is set.
/// - `pool_status == Warm` implies `user_id` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub name: String,
    pub namespace: String,
    pub kind: SandboxKind,
    pub pool_status: PoolStatus,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub image: String,
    pub phase: ObservedPhase,
    pub is_ready: bool,
    pub pod_ip: Option<String>,
    pub node_name: Option<String>,
}

impl Sandbox {
    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            user_id: self.user_id.clone(),
            pod_ip: self.pod_ip.clone(),
            node_name: self.node_name.clone(),
        }
    }

    pub fn is_warm(&self) -> bool {
        self.pool_status == PoolStatus::Warm
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self.pool_status, PoolStatus::Allocated | PoolStatus::Manual)
    }

    /// Invariant check used by tests and by defensive assertions at the
    /// orchestrator adapter boundary; never called on the hot path.
    pub fn satisfies_invariants(&self) -> bool {
        match self.pool_status {
            PoolStatus::Allocated | PoolStatus::Manual => {
                self.user_id.is_some() && self.allocated_at.is_some()
            }
            PoolStatus::Warm => self.user_id.is_none(),
            _ => true,
        }
    }

    /// Builds a `Sandbox` from a `Pod`'s labels, annotations and status.
    /// Returns `None` if the pod lacks the pool-status label (not one of
    /// ours).
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let meta = &pod.metadata;
        let labels = meta.labels.clone().unwrap_or_default();
        let annotations = meta.annotations.clone().unwrap_or_default();

        let pool_status = PoolStatus::parse(labels.get(LABEL_POOL_STATUS)?)?;
        let kind = match labels.get(LABEL_KIND).map(String::as_str) {
            Some("mcp") => SandboxKind::Mcp,
            _ => SandboxKind::Executor,
        };

        let created_at = annotations
            .get(ANNOTATION_CREATED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let allocated_at = annotations
            .get(ANNOTATION_ALLOCATED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let last_activity_at = annotations
            .get(ANNOTATION_LAST_ACTIVITY_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let status = pod.status.as_ref();
        let phase = ObservedPhase::from(status.and_then(|s| s.phase.as_deref()));
        let is_ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);
        let pod_ip = status.and_then(|s| s.pod_ip.clone());
        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());

        let image = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();

        Some(Sandbox {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            kind,
            pool_status,
            user_id: labels.get(LABEL_POOL_USER).cloned(),
            created_at,
            allocated_at,
            last_activity_at,
            image,
            phase,
            is_ready,
            pod_ip,
            node_name,
        })
    }
}

/// Generates a unique sandbox name: `<prefix>-<kind>-<8 hex chars>`.
pub fn generate_name(prefix: &str, kind: SandboxKind) -> String {
    use rand::Rng;
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| {
                let c = rng.gen_range(0..16);
                std::char::from_digit(c, 16).unwrap()
            })
            .collect()
    };
    format!("{prefix}-{}-{suffix}", kind.as_label_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_pod(pool_status: &str, has_user: bool, phase: &str, ready: bool) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_POOL_STATUS.to_string(), pool_status.to_string());
        labels.insert(LABEL_KIND.to_string(), "executor".to_string());
        if has_user {
            labels.insert(LABEL_POOL_USER.to_string(), "u1".to_string());
        }
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_CREATED_AT.to_string(), Utc::now().to_rfc3339());
        if has_user {
            annotations.insert(ANNOTATION_ALLOCATED_AT.to_string(), Utc::now().to_rfc3339());
        }

        Pod {
            metadata: ObjectMeta {
                name: Some("sbx-1".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    image: Some("sandbox-image:latest".to_string()),
                    ..Default::default()
                }],
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.0.0.5".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn from_pod_parses_warm_sandbox() {
        let pod = test_pod("warm", false, "Running", true);
        let sbx = Sandbox::from_pod(&pod).unwrap();
        assert!(sbx.is_warm());
        assert!(sbx.user_id.is_none());
        assert!(sbx.satisfies_invariants());
    }

    #[test]
    fn from_pod_returns_none_without_pool_label() {
        let mut pod = test_pod("warm", false, "Running", true);
        pod.metadata.labels.as_mut().unwrap().remove(LABEL_POOL_STATUS);
        assert!(Sandbox::from_pod(&pod).is_none());
    }

    #[test]
    fn allocated_without_user_violates_invariant() {
        let sbx = Sandbox {
            name: "x".into(),
            namespace: "default".into(),
            kind: SandboxKind::Executor,
            pool_status: PoolStatus::Allocated,
            user_id: None,
            created_at: Utc::now(),
            allocated_at: None,
            last_activity_at: None,
            image: "img".into(),
            phase: ObservedPhase::Running,
            is_ready: true,
            pod_ip: None,
            node_name: None,
        };
        assert!(!sbx.satisfies_invariants());
    }

    #[test]
    fn generate_name_has_expected_shape() {
        let name = generate_name("sbx", SandboxKind::Executor);
        assert!(name.starts_with("sbx-executor-"));
        assert_eq!(name.len(), "sbx-executor-".len() + 8);
    }

    fn test_spec(image: &str) -> SandboxSpec {
        SandboxSpec {
            kind: SandboxKind::Executor,
            image: image.to_string(),
            resources: ResourceSpec::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn validate_spec_accepts_well_formed_image() {
        assert!(validate_spec(&test_spec("sandbox-runtime:latest")).is_ok());
    }

    #[test]
    fn validate_spec_rejects_empty_image() {
        let err = validate_spec(&test_spec("")).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn validate_spec_rejects_whitespace_in_image() {
        let err = validate_spec(&test_spec("sandbox runtime")).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn validate_spec_rejects_blank_cpu_limit() {
        let mut spec = test_spec("sandbox-runtime:latest");
        spec.resources.cpu_limit = Some("  ".to_string());
        assert!(validate_spec(&spec).is_err());
    }
}
