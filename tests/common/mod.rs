use chrono::{DateTime, Utc};
use sandboxd::sandbox::{ObservedPhase, PoolStatus, Sandbox, SandboxKind};

/// Builds a `Sandbox` directly (skipping the `Pod` round-trip that
/// `Sandbox::from_pod` covers in `src/sandbox.rs`'s own unit tests) so
/// integration tests here can focus on cross-module behavior: cleanup
/// eviction decisions, pool invariants, allocation ordering.
#[allow(clippy::too_many_arguments)]
pub fn make_test_sandbox(
    name: &str,
    pool_status: PoolStatus,
    user_id: Option<&str>,
    created_at: DateTime<Utc>,
    allocated_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
) -> Sandbox {
    Sandbox {
        name: name.to_string(),
        namespace: "default".to_string(),
        kind: SandboxKind::Executor,
        pool_status,
        user_id: user_id.map(str::to_string),
        created_at,
        allocated_at,
        last_activity_at,
        image: "sandbox-runtime:latest".to_string(),
        phase: ObservedPhase::Running,
        is_ready: true,
        pod_ip: Some("10.0.0.5".to_string()),
        node_name: Some("node-1".to_string()),
    }
}
