use std::sync::LazyLock;

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::error::ControlPlaneError;
use crate::events::AllowedUpstream;
use crate::orchestrator::{LabelAnnotationDelta, OrchestratorAdapter};
use crate::sandbox::{
    generate_name, PoolStatus, Sandbox, SandboxKind, SandboxSpec, ANNOTATION_ALLOCATED_AT,
    ANNOTATION_LAST_ACTIVITY_AT, LABEL_KIND, LABEL_POOL_STATUS, LABEL_POOL_USER,
};

pub static POOL_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static ALLOCATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("sandboxd_allocations_total", "Allocation attempts by outcome"),
        &["kind", "outcome"],
    )
    .unwrap();
    POOL_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static BACKFILL_CREATED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("sandboxd_backfill_created_total", "Sandboxes created by back-fill"),
        &["kind"],
    )
    .unwrap();
    POOL_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POOL_SIZE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("sandboxd_pool_size", "Current sandbox count by kind and status"),
        &["kind", "status"],
    )
    .unwrap();
    POOL_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Forces metric registration at process start, mirroring the registration
/// block every long-running command in this codebase runs before serving
/// traffic.
pub fn force_metric_registration() {
    LazyLock::force(&ALLOCATIONS_TOTAL);
    LazyLock::force(&BACKFILL_CREATED_TOTAL);
    LazyLock::force(&POOL_SIZE);
}

#[derive(Debug, Clone, Copy)]
pub struct PoolTargets {
    pub warm: u32,
    pub max_total: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatusReport {
    pub kind: &'static str,
    pub creating: u32,
    pub warm: u32,
    pub allocated: u32,
    pub manual: u32,
    pub total: u32,
    pub target: u32,
    pub max_total: u32,
}

pub struct PoolManager {
    adapter: OrchestratorAdapter,
    broker: std::sync::Arc<dyn BrokerClient>,
    name_prefix: String,
}

impl PoolManager {
    pub fn new(
        adapter: OrchestratorAdapter,
        broker: std::sync::Arc<dyn BrokerClient>,
        name_prefix: impl Into<String>,
    ) -> Self {
        PoolManager {
            adapter,
            broker,
            name_prefix: name_prefix.into(),
        }
    }

    fn selector(kind: SandboxKind) -> String {
        format!("{LABEL_KIND}={}", kind.as_label_value())
    }

    /// Allocates a warm sandbox to `user_id`, racing other controllers via
    /// compare-and-set on the oldest warm candidates first. Returns
    /// `NotFound` (repurposed as "no warm sandbox available") when every
    /// candidate was claimed by someone else; callers should fall back to
    /// `create_on_demand`.
    pub async fn allocate_warm(
        &self,
        user_id: &str,
        kind: SandboxKind,
        allowed_upstreams: Vec<AllowedUpstream>,
    ) -> Result<Sandbox, ControlPlaneError> {
        let mut candidates = self.adapter.list_sandboxes(&Self::selector(kind)).await?;
        candidates.retain(|s| s.pool_status == PoolStatus::Warm);
        candidates.sort_by_key(|s| s.created_at);

        for candidate in candidates {
            let delta = LabelAnnotationDelta {
                labels: [
                    (LABEL_POOL_STATUS.to_string(), PoolStatus::Allocated.as_label_value().to_string()),
                    (LABEL_POOL_USER.to_string(), user_id.to_string()),
                ]
                .into_iter()
                .collect(),
                annotations: [
                    (ANNOTATION_ALLOCATED_AT.to_string(), chrono::Utc::now().to_rfc3339()),
                    (ANNOTATION_LAST_ACTIVITY_AT.to_string(), chrono::Utc::now().to_rfc3339()),
                ]
                .into_iter()
                .collect(),
            };

            // resource_version isn't tracked on `Sandbox`; the adapter's
            // patch still surfaces a 409 on a stale write, which is all the
            // compare-and-set semantics require here.
            match self
                .adapter
                .patch_labels_annotations(&candidate.name, "", &delta)
                .await
            {
                Ok(sandbox) => {
                    ALLOCATIONS_TOTAL
                        .with_label_values(&[kind.as_label_value(), "warm_hit"])
                        .inc();
                    info!(sandbox = %sandbox.name, user_id, "sandbox_allocated");

                    let broker = self.broker.clone();
                    let sandbox_id = sandbox.name.clone();
                    let user = user_id.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = broker
                            .register_binding(&sandbox_id, &user, &allowed_upstreams)
                            .await
                        {
                            warn!(sandbox = %sandbox_id, error = %e, "binding_registration_failed");
                        }
                    });

                    return Ok(sandbox);
                }
                Err(ControlPlaneError::Conflict(_)) | Err(ControlPlaneError::NotFound(_)) => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        ALLOCATIONS_TOTAL
            .with_label_values(&[kind.as_label_value(), "no_warm"])
            .inc();
        Err(ControlPlaneError::NotFound("no warm sandbox available".into()))
    }

    /// Creates a sandbox directly, bound to `user_id` if given, subject to
    /// the global cap.
    pub async fn create_on_demand(
        &self,
        spec: &SandboxSpec,
        user_id: Option<&str>,
        max_total: u32,
    ) -> Result<Sandbox, ControlPlaneError> {
        let total = self.adapter.list_sandboxes(&Self::selector(spec.kind)).await?.len() as u32;
        if total >= max_total {
            return Err(ControlPlaneError::CapacityExceeded(format!(
                "at maximum of {max_total} sandboxes"
            )));
        }

        let name = generate_name(&self.name_prefix, spec.kind);
        let status = if user_id.is_some() {
            PoolStatus::Allocated
        } else {
            PoolStatus::Manual
        };
        let sandbox = self
            .adapter
            .create_sandbox(&name, spec, status.as_label_value(), user_id)
            .await?;
        ALLOCATIONS_TOTAL
            .with_label_values(&[spec.kind.as_label_value(), "on_demand"])
            .inc();
        info!(sandbox = %sandbox.name, "sandbox_created_on_demand");
        Ok(sandbox)
    }

    /// Back-fills the warm pool up to `targets.warm`, bounded by
    /// `targets.max_total`. Intended to run on a fixed interval behind the
    /// cluster-wide lease; never deletes.
    pub async fn backfill_tick(
        &self,
        kind: SandboxKind,
        spec: &SandboxSpec,
        targets: PoolTargets,
    ) -> Result<u32, ControlPlaneError> {
        let all = self.adapter.list_sandboxes(&Self::selector(kind)).await?;
        let warm = all.iter().filter(|s| s.pool_status == PoolStatus::Warm).count() as u32;
        let creating = all.iter().filter(|s| s.pool_status == PoolStatus::Creating).count() as u32;
        let total = all.len() as u32;

        let need = targets.warm.saturating_sub(warm + creating);
        let cap_remaining = targets.max_total.saturating_sub(total);
        let to_create = need.min(cap_remaining);

        for _ in 0..to_create {
            let name = generate_name(&self.name_prefix, kind);
            match self
                .adapter
                .create_sandbox(&name, spec, PoolStatus::Creating.as_label_value(), None)
                .await
            {
                Ok(sandbox) => {
                    BACKFILL_CREATED_TOTAL
                        .with_label_values(&[kind.as_label_value()])
                        .inc();
                    info!(sandbox = %sandbox.name, "backfill_created");
                }
                Err(e) => {
                    warn!(error = %e, "backfill_create_failed");
                }
            }
        }

        if to_create > 0 {
            info!(
                kind = kind.as_label_value(),
                created = to_create,
                warm,
                creating,
                total,
                target = targets.warm,
                "backfill_tick"
            );
        }

        Ok(to_create)
    }

    /// Updates `last_activity_at` to now. A no-op (not an error) if the
    /// sandbox no longer exists.
    pub async fn touch(&self, name: &str) -> Result<(), ControlPlaneError> {
        if self.adapter.get_sandbox(name).await?.is_none() {
            return Ok(());
        }
        let delta = LabelAnnotationDelta {
            labels: Default::default(),
            annotations: [(
                ANNOTATION_LAST_ACTIVITY_AT.to_string(),
                chrono::Utc::now().to_rfc3339(),
            )]
            .into_iter()
            .collect(),
        };
        match self.adapter.patch_labels_annotations(name, "", &delta).await {
            Ok(_) | Err(ControlPlaneError::Conflict(_)) | Err(ControlPlaneError::NotFound(_)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(
        &self,
        kind: SandboxKind,
        targets: PoolTargets,
    ) -> Result<PoolStatusReport, ControlPlaneError> {
        let all = self.adapter.list_sandboxes(&Self::selector(kind)).await?;
        let creating = all.iter().filter(|s| s.pool_status == PoolStatus::Creating).count() as u32;
        let warm = all.iter().filter(|s| s.pool_status == PoolStatus::Warm).count() as u32;
        let allocated = all.iter().filter(|s| s.pool_status == PoolStatus::Allocated).count() as u32;
        let manual = all.iter().filter(|s| s.pool_status == PoolStatus::Manual).count() as u32;

        POOL_SIZE.with_label_values(&[kind.as_label_value(), "warm"]).set(warm as i64);
        POOL_SIZE.with_label_values(&[kind.as_label_value(), "allocated"]).set(allocated as i64);

        Ok(PoolStatusReport {
            kind: match kind {
                SandboxKind::Executor => "executor",
                SandboxKind::Mcp => "mcp",
            },
            creating,
            warm,
            allocated,
            manual,
            total: all.len() as u32,
            target: targets.warm,
            max_total: targets.max_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_math_respects_need_and_cap() {
        let targets = PoolTargets { warm: 3, max_total: 4 };
        let warm = 1u32;
        let creating = 0u32;
        let total = 1u32;
        let need = targets.warm.saturating_sub(warm + creating);
        let cap_remaining = targets.max_total.saturating_sub(total);
        assert_eq!(need, 2);
        assert_eq!(cap_remaining, 3);
        assert_eq!(need.min(cap_remaining), 2);
    }

    #[test]
    fn backfill_never_exceeds_cap() {
        let targets = PoolTargets { warm: 5, max_total: 2 };
        let total = 2u32;
        let need = targets.warm;
        let cap_remaining = targets.max_total.saturating_sub(total);
        assert_eq!(need.min(cap_remaining), 0);
    }

    #[test]
    fn metrics_register_without_panicking() {
        force_metric_registration();
        let families = POOL_REGISTRY.gather();
        assert!(!families.is_empty());
    }
}
