use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

const REQUEST_ID_HEADER: &str = "x-request-id";

use crate::error::ControlPlaneError;
use crate::events::LifecycleEvent;
use crate::lifecycle::{self, LifecycleTimeouts};
use crate::orchestrator::OrchestratorAdapter;
use crate::pool::{PoolManager, PoolStatusReport, PoolTargets};
use crate::sandbox::{validate_spec, SandboxInfo, SandboxKind, SandboxSpec};

pub struct GatewayState {
    pub adapter: OrchestratorAdapter,
    pub pool: PoolManager,
    pub admin_key: String,
    pub targets: PoolTargets,
    pub ready: AtomicBool,
}

/// Generates and propagates an `x-request-id` header on every request so a
/// single allocation or execution can be traced across the gateway's
/// tracing spans and back into the client's response, even though the
/// lifecycle/execution event bodies themselves carry no such field.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let request_id_header = axum::http::HeaderName::from_static(REQUEST_ID_HEADER);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/api/sandboxes/allocate", post(allocate_handler))
        .route("/api/sandboxes", post(create_handler).get(list_handler))
        .route("/api/sandboxes/:name", get(get_handler).delete(delete_handler))
        .route("/api/sandboxes/:name/execute", post(execute_handler))
        .route("/api/pool/status", get(pool_status_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id_header.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header)),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<GatewayState>>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler() -> impl IntoResponse {
    use prometheus::{Encoder, TextEncoder};
    let families = crate::pool::POOL_REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf).unwrap_or_default();
    (
        [("content-type", "text/plain; version=0.0.4")],
        String::from_utf8(buf).unwrap_or_default(),
    )
}

fn check_admin_key(headers: &HeaderMap, expected: &str) -> Result<(), ControlPlaneError> {
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected {
        Ok(())
    } else {
        Err(ControlPlaneError::PolicyDenied("invalid admin key".into()))
    }
}

#[derive(Deserialize)]
struct AllocateRequest {
    user_id: String,
    #[serde(default)]
    kind: Option<String>,
}

fn parse_kind(raw: Option<&str>) -> SandboxKind {
    match raw {
        Some("mcp") => SandboxKind::Mcp,
        _ => SandboxKind::Executor,
    }
}

/// Allocates a sandbox, streaming lifecycle events as server-sent events.
/// Tries the warm pool first; on exhaustion falls back to a synchronous
/// on-demand create and tracks it through to `Ready`/`Failed`.
async fn allocate_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(req): Json<AllocateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    let kind = parse_kind(req.kind.as_deref());

    let (tx, rx) = mpsc::channel(32);

    match state.pool.allocate_warm(&req.user_id, kind, Vec::new()).await {
        Ok(sandbox) => {
            let elapsed = 0.0;
            let _ = tx
                .send(LifecycleEvent::Ready { sandbox: sandbox.info(), elapsed_seconds: elapsed })
                .await;
        }
        Err(ControlPlaneError::NotFound(_)) => {
            let spec = SandboxSpec {
                kind,
                image: "sandbox-runtime:latest".to_string(),
                resources: Default::default(),
                env: Default::default(),
                labels: Default::default(),
            };
            validate_spec(&spec)?;
            let sandbox = state
                .pool
                .create_on_demand(&spec, Some(&req.user_id), state.targets.max_total)
                .await?;
            let adapter = state.adapter.clone();
            let name = sandbox.name.clone();
            tokio::spawn(async move {
                if let Err(e) = lifecycle::track(&adapter, &name, LifecycleTimeouts::default(), tx).await {
                    warn!(sandbox = %name, error = %e, "lifecycle_tracking_failed");
                }
            });
        }
        Err(e) => return Err(e),
    }

    let stream = ReceiverStream::new(rx).map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream))
}

#[derive(Deserialize)]
struct CreateRequest {
    spec: SandboxSpec,
    #[serde(default)]
    user_id: Option<String>,
}

async fn create_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    validate_spec(&req.spec)?;

    let sandbox = state
        .pool
        .create_on_demand(&req.spec, req.user_id.as_deref(), state.targets.max_total)
        .await?;

    let (tx, rx) = mpsc::channel(32);
    let adapter = state.adapter.clone();
    let name = sandbox.name.clone();
    tokio::spawn(async move {
        if let Err(e) = lifecycle::track(&adapter, &name, LifecycleTimeouts::default(), tx).await {
            warn!(sandbox = %name, error = %e, "lifecycle_tracking_failed");
        }
    });

    let stream = ReceiverStream::new(rx).map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream))
}

async fn list_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SandboxInfo>>, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    let all = state.adapter.list_sandboxes("").await?;
    Ok(Json(all.into_iter().map(|s| s.info()).collect()))
}

async fn get_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<SandboxInfo>, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    let sandbox = state
        .adapter
        .get_sandbox(&name)
        .await?
        .ok_or_else(|| ControlPlaneError::NotFound(format!("sandbox {name} not found")))?;
    Ok(Json(sandbox.info()))
}

async fn delete_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    state.adapter.delete_sandbox(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
    #[serde(default = "default_timeout")]
    timeout_seconds: u32,
}

fn default_timeout() -> u32 {
    300
}

/// Proxies a command to the executor contract inside the sandbox, touching
/// the sandbox's activity timestamp first and relaying the executor's
/// event stream verbatim.
async fn execute_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    state.pool.touch(&name).await?;

    let sandbox = state
        .adapter
        .get_sandbox(&name)
        .await?
        .ok_or_else(|| ControlPlaneError::NotFound(format!("sandbox {name} not found")))?;
    let ip = sandbox
        .pod_ip
        .ok_or_else(|| ControlPlaneError::Transient("sandbox has no pod ip yet".into()))?;

    let (tx, rx) = mpsc::channel::<crate::events::ExecutionEvent>(32);
    tokio::spawn(async move {
        if let Err(e) = relay_execution(&ip, &req.command, req.timeout_seconds, tx).await {
            warn!(error = %e, "execute_relay_failed");
        }
    });

    let stream = ReceiverStream::new(rx).map(|ev| {
        let data = serde_json::to_string(&ev).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream))
}

async fn relay_execution(
    ip: &str,
    command: &str,
    timeout_seconds: u32,
    tx: mpsc::Sender<crate::events::ExecutionEvent>,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{ip}:8080/api/execute"))
        .json(&serde_json::json!({ "command": command, "timeoutSeconds": timeout_seconds }))
        .send()
        .await;

    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            let _ = tx
                .send(crate::events::ExecutionEvent::CompletedEvent {
                    pid: 0,
                    exit_code: -1,
                    timed_out: false,
                })
                .await;
            return Err(e.into());
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let _ = tx
            .send(crate::events::ExecutionEvent::CompletedEvent {
                pid: 0,
                exit_code: -1,
                timed_out: false,
            })
            .await;
        anyhow::bail!("executor returned {status}");
    }

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(idx) = buf.find("\n\n") {
            let record = buf[..idx].to_string();
            buf.drain(..idx + 2);
            if let Some(data) = record.strip_prefix("data: ") {
                if let Ok(ev) = serde_json::from_str::<crate::events::ExecutionEvent>(data) {
                    let _ = tx.send(ev).await;
                }
            }
        }
    }
    Ok(())
}

async fn pool_status_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<PoolStatusReport>, ControlPlaneError> {
    check_admin_key(&headers, &state.admin_key)?;
    let report = state.pool.status(SandboxKind::Executor, state.targets).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let app = Router::new().route("/healthz", get(healthz));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/healthz").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn admin_key_rejects_mismatch() {
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-key", "wrong".parse().unwrap());
        let result = check_admin_key(&headers, "correct");
        assert!(matches!(result, Err(ControlPlaneError::PolicyDenied(_))));
    }

    #[test]
    fn admin_key_accepts_match() {
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-key", "correct".parse().unwrap());
        assert!(check_admin_key(&headers, "correct").is_ok());
    }

    #[test]
    fn parse_kind_defaults_to_executor() {
        assert!(matches!(parse_kind(None), SandboxKind::Executor));
        assert!(matches!(parse_kind(Some("mcp")), SandboxKind::Mcp));
    }
}
