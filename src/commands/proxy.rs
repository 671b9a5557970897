use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use sandboxd::broker::HttpBrokerClient;
use sandboxd::ca::CertAuthority;
use sandboxd::events::DomainPolicy;
use sandboxd::proxy::{self, ProxyState};

#[allow(clippy::too_many_arguments)]
pub async fn serve(
    proxy_addr: &str,
    admin_addr: &str,
    policy_file: &str,
    ca_cert: Option<&str>,
    ca_key: Option<&str>,
    broker_url: &str,
    sandbox_id: &str,
) -> Result<()> {
    proxy::force_metric_registration();

    let policy_raw = std::fs::read_to_string(policy_file).context("failed to read policy file")?;
    let policy_map = serde_json::from_str(&policy_raw).context("failed to parse policy file")?;
    let policy = DomainPolicy::new(policy_map);

    let ca = Arc::new(
        CertAuthority::load_or_generate(ca_cert, ca_key).context("failed to load or generate CA")?,
    );
    let broker = Arc::new(HttpBrokerClient::new(broker_url));
    let state = Arc::new(ProxyState::new(policy, ca, broker, sandbox_id));

    let (shutdown_tx, _) = broadcast::channel(1);

    let admin_router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(admin_metrics))
        .route("/git-credential", post(proxy::git_credential_handler))
        .with_state(state.clone());
    let admin_listener = TcpListener::bind(admin_addr).await.context("failed to bind admin address")?;
    let admin_shutdown = shutdown_tx.subscribe();
    let admin_task = tokio::spawn(async move {
        let mut rx = admin_shutdown;
        axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async move {
                let _ = rx.recv().await;
            })
            .await
    });

    let proxy_shutdown = shutdown_tx.subscribe();
    let proxy_task = tokio::spawn(proxy::serve(proxy_addr.to_string(), state, proxy_shutdown));

    info!(proxy_addr, admin_addr, "egress_proxy_started");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("egress_proxy_shutdown_signal");
        }
    }
    let _ = shutdown_tx.send(());
    let _ = admin_task.await;
    let _ = proxy_task.await;
    Ok(())
}

async fn admin_metrics() -> impl axum::response::IntoResponse {
    use prometheus::{Encoder, TextEncoder};
    let families = sandboxd::proxy::PROXY_REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf).unwrap_or_default();
    (
        [("content-type", "text/plain; version=0.0.4")],
        String::from_utf8(buf).unwrap_or_default(),
    )
}
