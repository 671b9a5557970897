use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tokio::sync::broadcast;
use tracing::{info, warn};

const LEASE_DURATION_SECONDS: i32 = 15;

/// Acquires (or takes over, if expired or already ours) a cluster-wide
/// lease gating the back-fill and cleanup loops. Allocation is never
/// gated behind this lease — only idempotent periodic work is.
pub async fn acquire(client: Client, namespace: &str, name: &str, holder_identity: &str) -> kube::Result<()> {
    let leases: Api<Lease> = Api::namespaced(client, namespace);
    let now = Utc::now();
    let micro_now = MicroTime(now);

    let desired = Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder_identity.to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(micro_now.clone()),
            renew_time: Some(micro_now),
            ..Default::default()
        }),
    };

    match leases.create(&Default::default(), &desired).await {
        Ok(_) => {
            info!(lease = name, holder = holder_identity, "lease_acquired");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => take_over_if_eligible(&leases, name, holder_identity).await,
        Err(e) => Err(e),
    }
}

async fn take_over_if_eligible(leases: &Api<Lease>, name: &str, holder_identity: &str) -> kube::Result<()> {
    let existing = leases.get(name).await?;
    let spec = existing.spec.unwrap_or_default();
    let now = Utc::now();

    let is_ours = spec.holder_identity.as_deref() == Some(holder_identity);
    let is_expired = spec
        .renew_time
        .as_ref()
        .map(|rt| {
            let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64;
            now - rt.0 > chrono::Duration::seconds(duration)
        })
        .unwrap_or(true);

    if !is_ours && !is_expired {
        return Ok(());
    }

    let micro_now = MicroTime(now);
    let patch = serde_json::json!({
        "apiVersion": "coordination.k8s.io/v1",
        "kind": "Lease",
        "spec": {
            "holderIdentity": holder_identity,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": micro_now,
            "renewTime": micro_now,
        }
    });

    leases
        .patch(name, &PatchParams::apply("sandboxd-lease"), &Patch::Merge(&patch))
        .await?;
    info!(lease = name, holder = holder_identity, "lease_taken_over");
    Ok(())
}

/// Renews the lease on an interval at most half the lease TTL until
/// `shutdown` fires.
pub async fn renewal_loop(
    client: Client,
    namespace: &str,
    name: &str,
    holder_identity: &str,
    mut shutdown: broadcast::Receiver<()>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);
    let interval = Duration::from_secs((LEASE_DURATION_SECONDS / 2).max(1) as u64);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let patch = serde_json::json!({
                    "apiVersion": "coordination.k8s.io/v1",
                    "kind": "Lease",
                    "spec": { "renewTime": MicroTime(Utc::now()) }
                });
                if let Err(e) = leases
                    .patch(name, &PatchParams::apply("sandboxd-lease"), &Patch::Merge(&patch))
                    .await
                {
                    warn!(lease = name, error = %e, "lease_renewal_failed");
                }
            }
            _ = shutdown.recv() => {
                info!(lease = name, "lease_renewal_stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn lease_duration_is_within_spec_range() {
        assert!(super::LEASE_DURATION_SECONDS >= 5 && super::LEASE_DURATION_SECONDS <= 60);
    }
}
