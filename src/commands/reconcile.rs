use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

use sandboxd::broker::HttpBrokerClient;
use sandboxd::cleanup::{self, CleanupConfig};
use sandboxd::lease;
use sandboxd::orchestrator::OrchestratorAdapter;
use sandboxd::pool::{self, PoolManager, PoolTargets};
use sandboxd::sandbox::{SandboxKind, SandboxSpec};

const LEASE_NAME: &str = "sandboxd-backfill-leader";

/// Runs the back-fill (§4.2) and cleanup (§4.4) loops. Back-fill is gated
/// behind a cluster-wide lease so only one controller creates warm
/// sandboxes at a time; cleanup runs unconditionally on every controller
/// since deletion is idempotent and safe under concurrency.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    namespace: &str,
    admin_addr: &str,
    broker_url: &str,
    warm_spec_file: &str,
    warm: u32,
    max_total: u32,
    backfill_interval_secs: u64,
    cleanup_interval_secs: u64,
    idle_timeout_secs: u64,
    max_lifetime_secs: u64,
) -> Result<()> {
    pool::force_metric_registration();
    cleanup::force_metric_registration();

    let warm_spec_raw = std::fs::read_to_string(warm_spec_file).context("reading warm sandbox spec file")?;
    let warm_spec: SandboxSpec = serde_yaml::from_str(&warm_spec_raw).context("parsing warm sandbox spec file")?;

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let adapter = OrchestratorAdapter::new(client.clone(), namespace);
    let broker: Arc<dyn sandboxd::broker::BrokerClient> = Arc::new(HttpBrokerClient::new(broker_url));
    let pool_manager = PoolManager::new(adapter.clone(), broker, "sbx");
    let targets = PoolTargets { warm, max_total };

    let holder_identity = format!("sandboxd-reconcile-{}", uuid::Uuid::new_v4());
    let (shutdown_tx, _) = broadcast::channel(1);

    let admin_addr: SocketAddr = admin_addr.parse().context("invalid admin address")?;
    let admin_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { StatusCode::OK }))
        .route("/metrics", get(metrics_handler));
    let admin_listener = TcpListener::bind(admin_addr).await.context("failed to bind admin address")?;
    let admin_shutdown = shutdown_tx.subscribe();
    let admin_task = tokio::spawn(async move {
        let mut rx = admin_shutdown;
        let _ = axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async move {
                let _ = rx.recv().await;
            })
            .await;
    });

    let renewal_shutdown = shutdown_tx.subscribe();
    let renewal_client = client.clone();
    let renewal_namespace = namespace.to_string();
    let renewal_holder = holder_identity.clone();
    let renewal_task = tokio::spawn(async move {
        lease::renewal_loop(renewal_client, &renewal_namespace, LEASE_NAME, &renewal_holder, renewal_shutdown).await
    });

    let cleanup_config = CleanupConfig {
        idle_timeout: Duration::from_secs(idle_timeout_secs),
        max_lifetime: Duration::from_secs(max_lifetime_secs),
    };

    let mut backfill_ticker = interval(Duration::from_secs(backfill_interval_secs));
    let mut cleanup_ticker = interval(Duration::from_secs(cleanup_interval_secs));

    info!(namespace, %holder_identity, "reconcile_started");
    loop {
        tokio::select! {
            _ = backfill_ticker.tick() => {
                if let Err(e) = lease::acquire(client.clone(), namespace, LEASE_NAME, &holder_identity).await {
                    warn!(error = %e, "backfill_lease_acquire_failed");
                    continue;
                }
                match pool_manager
                    .backfill_tick(SandboxKind::Executor, &warm_spec, targets)
                    .await
                {
                    Ok(created) if created > 0 => info!(created, "backfill_tick_completed"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "backfill_tick_failed"),
                }
            }
            _ = cleanup_ticker.tick() => {
                match cleanup::sweep(&adapter, cleanup_config).await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "cleanup_sweep_completed"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "cleanup_sweep_failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("reconcile_shutdown_signal");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = admin_task.await;
    renewal_task.abort();
    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    use prometheus::{Encoder, TextEncoder};
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&pool::POOL_REGISTRY.gather(), &mut buf).unwrap_or_default();
    encoder.encode(&cleanup::CLEANUP_REGISTRY.gather(), &mut buf).unwrap_or_default();
    (
        [("content-type", "text/plain; version=0.0.4")],
        String::from_utf8(buf).unwrap_or_default(),
    )
}
