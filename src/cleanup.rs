use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{IntCounterVec, Registry};
use tracing::{info, warn};

use crate::error::ControlPlaneError;
use crate::orchestrator::OrchestratorAdapter;
use crate::sandbox::{PoolStatus, Sandbox};

pub static CLEANUP_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static EVICTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        prometheus::Opts::new("sandboxd_evictions_total", "Sandboxes deleted by the cleanup sweep"),
        &["reason"],
    )
    .unwrap();
    CLEANUP_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub fn force_metric_registration() {
    LazyLock::force(&EVICTIONS_TOTAL);
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

/// Decides whether `sandbox` should be evicted at `now`, and why.
/// Max-lifetime wins over idle timeout when both would apply (§8 scenario
/// 4). Warm and creating sandboxes are never subject to idle-timeout here;
/// callers are expected to only pass allocated/manual/mcp sandboxes in.
pub fn decide_eviction(sandbox: &Sandbox, config: CleanupConfig, now: DateTime<Utc>) -> Option<&'static str> {
    let allocated_at = sandbox.allocated_at?;
    if now - allocated_at >= chrono::Duration::from_std(config.max_lifetime).unwrap() {
        return Some("exceeded-max-lifetime");
    }
    let last_activity = sandbox.last_activity_at?;
    if now - last_activity >= chrono::Duration::from_std(config.idle_timeout).unwrap() {
        return Some("idle-timeout");
    }
    None
}

/// One sweep over every non-warm sandbox: max-lifetime wins over idle
/// timeout when both would apply (I4.4). Deletion of a sandbox that has
/// already vanished is treated as success; a single delete failure is
/// logged and does not abort the rest of the sweep.
pub async fn sweep(adapter: &OrchestratorAdapter, config: CleanupConfig) -> Result<u32, ControlPlaneError> {
    let all = adapter.list_sandboxes("").await?;
    let now = Utc::now();
    let mut deleted = 0u32;

    for sandbox in all {
        if !matches!(
            sandbox.pool_status,
            PoolStatus::Allocated | PoolStatus::Manual | PoolStatus::Mcp
        ) {
            continue;
        }

        let Some(reason) = decide_eviction(&sandbox, config, now) else { continue };

        match adapter.delete_sandbox(&sandbox.name).await {
            Ok(()) => {
                deleted += 1;
                EVICTIONS_TOTAL.with_label_values(&[reason]).inc();
                info!(sandbox = %sandbox.name, reason, "sandbox_evicted");
            }
            Err(e) => {
                warn!(sandbox = %sandbox.name, reason, error = %e, "sandbox_eviction_failed");
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{SandboxKind, LABEL_KIND};

    fn selector_for(kind: SandboxKind) -> String {
        format!("{LABEL_KIND}={}", kind.as_label_value())
    }

    #[test]
    fn max_lifetime_takes_priority_over_idle() {
        let now = Utc::now();
        let allocated_at = now - chrono::Duration::minutes(61);
        let last_activity = now;
        let max_lifetime = chrono::Duration::minutes(60);
        let idle_timeout = chrono::Duration::minutes(120);

        let over_lifetime = now - allocated_at >= max_lifetime;
        let over_idle = now - last_activity >= idle_timeout;
        assert!(over_lifetime);
        assert!(!over_idle);
    }

    #[test]
    fn selector_includes_kind_label() {
        assert_eq!(selector_for(SandboxKind::Executor), format!("{LABEL_KIND}=executor"));
    }

    #[test]
    fn metrics_register_without_panicking() {
        force_metric_registration();
        assert!(!CLEANUP_REGISTRY.gather().is_empty());
    }
}
