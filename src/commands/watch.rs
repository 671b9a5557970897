use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{info, warn};

use sandboxd::lifecycle::{check_ready, ReadinessOutcome};
use sandboxd::orchestrator::{LabelAnnotationDelta, OrchestratorAdapter};
use sandboxd::sandbox::{PoolStatus, LABEL_POOL_STATUS};

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static PROMOTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "sandboxd_watch_promotions_total",
            "Sandboxes promoted from creating to warm, or failed, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

fn force_metric_registration() {
    LazyLock::force(&PROMOTIONS_TOTAL);
}

/// Drives C4 for sandboxes that back-fill created with no caller waiting
/// on a lifecycle stream: polls every `creating` sandbox each tick, and on
/// `Running + ready + healthy` relabels it `warm` (the transition the data
/// model's invariant (d) names as the only legal creating -> warm path). A
/// sandbox whose pod phase fails, or that blows through `pod_ready_timeout`
/// while still waiting, is deleted rather than left to rot in `creating`.
pub async fn run(namespace: &str, admin_addr: &str, poll_interval_secs: u64, pod_ready_timeout_secs: u64) -> Result<()> {
    force_metric_registration();

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let adapter = OrchestratorAdapter::new(client, namespace);

    let admin_addr: SocketAddr = admin_addr.parse().context("invalid admin address")?;
    let admin_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { StatusCode::OK }))
        .route("/metrics", get(metrics_handler));
    let admin_listener = TcpListener::bind(admin_addr).await.context("failed to bind admin address")?;
    let admin_task = tokio::spawn(async move {
        let _ = axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    });

    let poll_interval = Duration::from_secs(poll_interval_secs);
    let pod_ready_timeout = chrono::Duration::seconds(pod_ready_timeout_secs as i64);
    let probe_timeout = Duration::from_secs(5);
    let mut ticker = interval(poll_interval);

    info!(namespace, poll_interval_secs, "watch_started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = promote_tick(&adapter, pod_ready_timeout, probe_timeout).await {
                    warn!(error = %e, "watch_tick_failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("watch_shutdown_signal");
                break;
            }
        }
    }
    admin_task.abort();
    Ok(())
}

async fn promote_tick(
    adapter: &OrchestratorAdapter,
    pod_ready_timeout: chrono::Duration,
    probe_timeout: Duration,
) -> anyhow::Result<()> {
    let creating = adapter
        .list_sandboxes(&format!("{LABEL_POOL_STATUS}=creating"))
        .await?;

    for sandbox in creating {
        match check_ready(adapter, &sandbox.name, probe_timeout).await {
            Ok(ReadinessOutcome::Ready(_)) => {
                let delta = LabelAnnotationDelta {
                    labels: [(LABEL_POOL_STATUS.to_string(), PoolStatus::Warm.as_label_value().to_string())]
                        .into_iter()
                        .collect(),
                    annotations: Default::default(),
                };
                match adapter.patch_labels_annotations(&sandbox.name, "", &delta).await {
                    Ok(_) => {
                        PROMOTIONS_TOTAL.with_label_values(&["promoted"]).inc();
                        info!(sandbox = %sandbox.name, "sandbox_promoted_to_warm");
                    }
                    Err(e) => warn!(sandbox = %sandbox.name, error = %e, "sandbox_promotion_failed"),
                }
            }
            Ok(ReadinessOutcome::Failed(reason)) => {
                PROMOTIONS_TOTAL.with_label_values(&["failed"]).inc();
                warn!(sandbox = %sandbox.name, reason, "sandbox_creation_failed");
                let _ = adapter.delete_sandbox(&sandbox.name).await;
            }
            Ok(ReadinessOutcome::Waiting) => {
                if Utc::now() - sandbox.created_at >= pod_ready_timeout {
                    PROMOTIONS_TOTAL.with_label_values(&["timeout"]).inc();
                    warn!(sandbox = %sandbox.name, "sandbox_creation_timed_out");
                    let _ = adapter.delete_sandbox(&sandbox.name).await;
                }
            }
            Ok(ReadinessOutcome::Gone) => {}
            Err(e) => warn!(sandbox = %sandbox.name, error = %e, "sandbox_readiness_check_failed"),
        }
    }
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf).unwrap_or_default();
    (
        [("content-type", "text/plain; version=0.0.4")],
        String::from_utf8(buf).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_panicking() {
        force_metric_registration();
        assert!(!REGISTRY.gather().is_empty());
    }
}
