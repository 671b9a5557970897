use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use prometheus::{IntCounterVec, Registry};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::ca::SharedCertAuthority;
use crate::events::{CachedToken, DomainPolicy, PolicyMode};

pub static PROXY_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static CONNECTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        prometheus::Opts::new("sandboxd_proxy_connections_total", "Proxy connections by decision"),
        &["decision"],
    )
    .unwrap();
    PROXY_REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub fn force_metric_registration() {
    LazyLock::force(&CONNECTIONS_TOTAL);
}

/// Shared, long-lived state injected into every accepted connection's
/// handler. None of it is process-global; it is constructed once at
/// startup and handed to each spawned task by reference.
pub struct ProxyState {
    pub policy: DomainPolicy,
    pub ca: SharedCertAuthority,
    pub broker: Arc<dyn BrokerClient>,
    pub sandbox_id: String,
    token_cache: DashMap<(String, Vec<String>), (CachedToken, chrono::DateTime<chrono::Utc>)>,
}

impl ProxyState {
    pub fn new(
        policy: DomainPolicy,
        ca: SharedCertAuthority,
        broker: Arc<dyn BrokerClient>,
        sandbox_id: impl Into<String>,
    ) -> Self {
        ProxyState {
            policy,
            ca,
            broker,
            sandbox_id: sandbox_id.into(),
            token_cache: DashMap::new(),
        }
    }

    async fn token_for(
        &self,
        host: &str,
        scopes: &[String],
    ) -> Result<CachedToken, crate::error::ControlPlaneError> {
        let key = (host.to_ascii_lowercase(), scopes.to_vec());
        let now = chrono::Utc::now();

        if let Some(entry) = self.token_cache.get(&key) {
            let (token, issued_at) = entry.value();
            if !token.needs_refresh(now, *issued_at) {
                return Ok(token.clone());
            }
        }

        let issued = self.broker.issue_token(&self.sandbox_id, host, scopes).await?;
        let token = CachedToken {
            upstream: host.to_string(),
            scopes: scopes.to_vec(),
            value: issued.access_token,
            token_type: issued.token_type,
            expires_at: issued.expires_at,
        };
        self.token_cache.insert(key, (token.clone(), now));
        Ok(token)
    }
}

/// Runs the forward-proxy accept loop until `shutdown` fires. Each accepted
/// connection is handled on its own task with no shared mutable state
/// beyond `state`'s concurrent maps.
pub async fn serve(
    addr: String,
    state: Arc<ProxyState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "proxy_listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        warn!(peer = %peer, error = %e, "proxy_connection_error");
                    }
                });
            }
            _ = shutdown.recv() => {
                info!("proxy_shutting_down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut inbound: TcpStream, state: Arc<ProxyState>) -> anyhow::Result<()> {
    let mut reader = BufReader::new(&mut inbound);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut parts = request_line.trim().splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    if method != "CONNECT" {
        drop(reader);
        inbound
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n")
            .await?;
        return Ok(());
    }

    // drain headers up to the blank line
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap_or(443)),
        None => (target.to_string(), 443u16),
    };

    let policy = state.policy.lookup(&host);
    match policy.mode {
        PolicyMode::Deny => {
            CONNECTIONS_TOTAL.with_label_values(&["deny"]).inc();
            info!(host, "proxy_connect_denied");
            drop(reader);
            inbound
                .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
                .await?;
            Ok(())
        }
        PolicyMode::Passthrough => {
            CONNECTIONS_TOTAL.with_label_values(&["passthrough"]).inc();
            drop(reader);
            inbound
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
            let (bytes_to_upstream, bytes_to_client) =
                tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await?;
            info!(host, bytes_to_upstream, bytes_to_client, "proxy_passthrough_closed");
            Ok(())
        }
        PolicyMode::Mitm => {
            CONNECTIONS_TOTAL.with_label_values(&["mitm"]).inc();
            drop(reader);
            inbound
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            handle_mitm(inbound, host, port, policy.allowed_scopes, state).await
        }
    }
}

async fn handle_mitm(
    inbound: TcpStream,
    host: String,
    port: u16,
    allowed_scopes: Vec<String>,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let leaf = state.ca.get_or_create_leaf(&host)?;
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
            .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())?
        .ok_or_else(|| anyhow::anyhow!("leaf key_pem contained no private key"))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let mut client_tls = acceptor.accept(inbound).await?;

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore {
            roots: webpki_roots_from_env(),
        })
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = rustls_pki_types::ServerName::try_from(host.clone())?;
    let upstream_tcp = TcpStream::connect((host.as_str(), port)).await?;
    let mut upstream_tls = connector.connect(server_name, upstream_tcp).await?;

    let mut reader = BufReader::new(&mut client_tls);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if !line.to_ascii_lowercase().starts_with("authorization:") {
            headers.push(line);
        }
    }

    let token = match state.token_for(&host, &allowed_scopes).await {
        Ok(t) => t,
        Err(e) => {
            warn!(host, error = %e, "proxy_token_acquisition_failed");
            let error_code = match &e {
                crate::error::ControlPlaneError::PolicyDenied(_) => "not_authorized",
                _ => "credential_broker_unavailable",
            };
            drop(reader);
            let body = format!("{{\"error\":\"{error_code}\",\"message\":\"{e}\"}}");
            client_tls
                .write_all(
                    format!(
                        "HTTP/1.1 502 Bad Gateway\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    )
                    .as_bytes(),
                )
                .await?;
            return Ok(());
        }
    };

    let mut outbound = request_line;
    for h in headers {
        outbound.push_str(&h);
    }
    outbound.push_str(&format!("Authorization: {} {}\r\n", token.token_type, token.value));
    outbound.push_str(&format!("X-Sandbox-Id: {}\r\n", state.sandbox_id));
    outbound.push_str("\r\n");

    upstream_tls.write_all(outbound.as_bytes()).await?;
    drop(reader);

    let mut client_tls = client_tls;
    let (to_upstream, to_client) =
        tokio::io::copy_bidirectional(&mut client_tls, &mut upstream_tls).await?;
    info!(host, to_upstream, to_client, "proxy_mitm_closed");
    Ok(())
}

/// The platform default trust store the sidecar uses for the outer
/// (upstream-facing) TLS connection; webpki's bundled Mozilla roots, not
/// anything sandbox-supplied.
fn webpki_roots_from_env() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    }
}

/// Parses Git's key-value credential protocol (`key=value` lines up to a
/// blank line or EOF) into a map. Unknown keys are kept but unused; `host`
/// is what the in-sandbox Git credential helper needs to ask for a token.
fn parse_git_kv(body: &str) -> std::collections::HashMap<String, String> {
    body.lines()
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Handles the sidecar admin port's Git credential helper endpoint (§6):
/// accepts Git's key-value request body and returns `username=.../
/// password=...` for the host it names, fetched from the broker under this
/// proxy's own sandbox identity. Used by the in-sandbox Git credential
/// helper for hosts the domain policy routes through `passthrough` (auth
/// stays provider-native rather than going through header injection).
pub async fn git_credential_handler(
    axum::extract::State(state): axum::extract::State<Arc<ProxyState>>,
    body: String,
) -> Result<String, axum::http::StatusCode> {
    let fields = parse_git_kv(&body);
    let Some(host) = fields.get("host") else {
        return Err(axum::http::StatusCode::BAD_REQUEST);
    };

    match state.broker.git_credential(&state.sandbox_id, host).await {
        Ok(cred) => Ok(format!("username={}\npassword={}\n\n", cred.username, cred.password)),
        Err(e) => {
            warn!(host, error = %e, "git_credential_lookup_failed");
            Err(axum::http::StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FakeBrokerClient;
    use crate::ca::CertAuthority;
    use crate::events::HostPolicy;
    use std::collections::HashMap;

    fn test_state() -> Arc<ProxyState> {
        let mut map = HashMap::new();
        map.insert(
            "github.com".to_string(),
            HostPolicy { mode: PolicyMode::Passthrough, allowed_scopes: vec![] },
        );
        map.insert(
            "graph.microsoft.com".to_string(),
            HostPolicy { mode: PolicyMode::Mitm, allowed_scopes: vec!["X".into()] },
        );
        Arc::new(ProxyState::new(
            DomainPolicy::new(map),
            Arc::new(CertAuthority::generate().unwrap()),
            Arc::new(FakeBrokerClient::new()),
            "sbx-test",
        ))
    }

    #[tokio::test]
    async fn unknown_host_denies() {
        let state = test_state();
        assert_eq!(state.policy.lookup("evil.example.com").mode, PolicyMode::Deny);
    }

    #[tokio::test]
    async fn token_cache_hits_on_second_call() {
        let state = test_state();
        state
            .broker
            .register_binding(
                "sbx-test",
                "u1",
                &[crate::events::AllowedUpstream { host: "graph.microsoft.com".into(), scopes: vec![] }],
            )
            .await
            .unwrap();

        let first = state.token_for("graph.microsoft.com", &[]).await.unwrap();
        let second = state.token_for("graph.microsoft.com", &[]).await.unwrap();
        assert_eq!(first.value, second.value);
    }

    #[test]
    fn metrics_register_without_panicking() {
        force_metric_registration();
        assert!(!PROXY_REGISTRY.gather().is_empty());
    }

    #[test]
    fn parse_git_kv_reads_protocol_and_host() {
        let fields = parse_git_kv("protocol=https\nhost=github.com\n\n");
        assert_eq!(fields.get("protocol").map(String::as_str), Some("https"));
        assert_eq!(fields.get("host").map(String::as_str), Some("github.com"));
    }

    #[tokio::test]
    async fn git_credential_handler_returns_credential_for_known_host() {
        let state = test_state();
        let body = "protocol=https\nhost=github.com\n\n".to_string();
        let resp = git_credential_handler(axum::extract::State(state), body).await.unwrap();
        assert!(resp.starts_with("username="));
        assert!(resp.contains("password="));
    }

    #[tokio::test]
    async fn git_credential_handler_rejects_missing_host() {
        let state = test_state();
        let body = "protocol=https\n\n".to_string();
        let err = git_credential_handler(axum::extract::State(state), body).await.unwrap_err();
        assert_eq!(err, axum::http::StatusCode::BAD_REQUEST);
    }
}
