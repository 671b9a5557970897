use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use sandboxd::gateway::{build_router, GatewayState};
use sandboxd::orchestrator::OrchestratorAdapter;
use sandboxd::pool::{self, PoolManager, PoolTargets};

#[allow(clippy::too_many_arguments)]
pub async fn serve(
    addr: &str,
    namespace: &str,
    admin_key_file: &str,
    broker_url: &str,
    warm: u32,
    max_total: u32,
    tls_cert: Option<&str>,
    tls_key: Option<&str>,
) -> Result<()> {
    pool::force_metric_registration();

    let admin_key = std::fs::read_to_string(admin_key_file)
        .context("failed to read admin key file")?
        .trim()
        .to_string();

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let adapter = OrchestratorAdapter::new(client, namespace);

    let broker: Arc<dyn sandboxd::broker::BrokerClient> =
        Arc::new(sandboxd::broker::HttpBrokerClient::new(broker_url));
    let pool_manager = PoolManager::new(adapter.clone(), broker, "sbx");

    let state = Arc::new(GatewayState {
        adapter,
        pool: pool_manager,
        admin_key,
        targets: PoolTargets { warm, max_total },
        ready: AtomicBool::new(true),
    });

    let app = build_router(state);

    match (tls_cert, tls_key) {
        (Some(cert), Some(key)) => serve_tls(addr, app, cert, key).await,
        _ => {
            let listener = TcpListener::bind(addr).await.context("failed to bind gateway address")?;
            info!(addr, "gateway_listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("gateway_shutting_down");
                })
                .await
                .context("gateway server error")
        }
    }
}

/// Serves the gateway over HTTPS using a provided certificate and key pair.
/// Mirrors the admission webhook's own optional-TLS serving pattern: load a
/// `RustlsConfig` from PEM files, bind with `axum_server`, and drive shutdown
/// through a `Handle` rather than a listener-level future.
async fn serve_tls(addr: &str, app: axum::Router, tls_cert: &str, tls_key: &str) -> Result<()> {
    let socket_addr: std::net::SocketAddr = addr.parse().context("invalid gateway address")?;
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("failed to load gateway TLS configuration")?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("gateway_shutting_down");
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    info!(addr, "gateway_listening_tls");
    axum_server::bind_rustls(socket_addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("gateway TLS server error")
}
