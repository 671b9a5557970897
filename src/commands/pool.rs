use anyhow::{Context, Result};
use futures::StreamExt;

/// Thin HTTP client for the pool's public surface (§6), used by the `pool`
/// CLI subcommands. Talks to the gateway exactly as any other caller would —
/// no special access beyond the admin key.
struct PoolClient {
    http: reqwest::Client,
    base_url: String,
    admin_key: String,
}

impl PoolClient {
    fn new(base_url: &str, admin_key: &str) -> Self {
        PoolClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_key: admin_key.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header("x-admin-key", &self.admin_key)
    }

    /// Reads a `text/event-stream` response body and prints each `data:`
    /// line as it arrives, mirroring the gateway's streaming contract
    /// (§4.5): the request terminates deterministically once the producer
    /// closes the stream.
    async fn print_event_stream(resp: reqwest::Response) -> Result<()> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("gateway returned {status}: {body}");
        }
        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading event stream")?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(idx) = buf.find("\n\n") {
                let record = buf[..idx].to_string();
                buf.drain(..idx + 2);
                if let Some(data) = record.strip_prefix("data: ") {
                    println!("{data}");
                }
            }
        }
        Ok(())
    }
}

pub async fn allocate(base_url: &str, admin_key: &str, user_id: &str, kind: &str) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::POST, "/api/sandboxes/allocate")
        .json(&serde_json::json!({ "user_id": user_id, "kind": kind }))
        .send()
        .await
        .context("sending allocate request")?;
    PoolClient::print_event_stream(resp).await
}

pub async fn create(base_url: &str, admin_key: &str, spec_file: &str, user_id: Option<&str>) -> Result<()> {
    let spec_raw = std::fs::read_to_string(spec_file).context("reading sandbox spec file")?;
    let spec: sandboxd::sandbox::SandboxSpec =
        serde_yaml::from_str(&spec_raw).context("parsing sandbox spec file")?;

    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::POST, "/api/sandboxes")
        .json(&serde_json::json!({ "spec": spec, "user_id": user_id }))
        .send()
        .await
        .context("sending create request")?;
    PoolClient::print_event_stream(resp).await
}

pub async fn get(base_url: &str, admin_key: &str, name: &str) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::GET, &format!("/api/sandboxes/{name}"))
        .send()
        .await
        .context("sending get request")?;
    let body: serde_json::Value = resp.json().await.context("parsing sandbox info")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn list(base_url: &str, admin_key: &str) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::GET, "/api/sandboxes")
        .send()
        .await
        .context("sending list request")?;
    let body: serde_json::Value = resp.json().await.context("parsing sandbox list")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn delete(base_url: &str, admin_key: &str, name: &str) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::DELETE, &format!("/api/sandboxes/{name}"))
        .send()
        .await
        .context("sending delete request")?;
    if !resp.status().is_success() {
        anyhow::bail!("gateway returned {}", resp.status());
    }
    println!("deleted {name}");
    Ok(())
}

/// Deletes every sandbox currently known to the gateway. Best-effort: one
/// failed delete is reported but does not stop the rest, matching the
/// cleanup worker's own per-sandbox failure isolation.
pub async fn delete_all(base_url: &str, admin_key: &str) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::GET, "/api/sandboxes")
        .send()
        .await
        .context("listing sandboxes")?;
    let sandboxes: Vec<sandboxd::sandbox::SandboxInfo> =
        resp.json().await.context("parsing sandbox list")?;

    let mut failures = 0;
    for sandbox in &sandboxes {
        let resp = client
            .request(reqwest::Method::DELETE, &format!("/api/sandboxes/{}", sandbox.name))
            .send()
            .await
            .context("sending delete request")?;
        if resp.status().is_success() {
            println!("deleted {}", sandbox.name);
        } else {
            failures += 1;
            eprintln!("failed to delete {}: {}", sandbox.name, resp.status());
        }
    }
    println!("deleted {}/{} sandboxes", sandboxes.len() - failures, sandboxes.len());
    Ok(())
}

pub async fn execute(base_url: &str, admin_key: &str, name: &str, command: &str, timeout_seconds: u32) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::POST, &format!("/api/sandboxes/{name}/execute"))
        .json(&serde_json::json!({ "command": command, "timeout_seconds": timeout_seconds }))
        .send()
        .await
        .context("sending execute request")?;
    PoolClient::print_event_stream(resp).await
}

pub async fn status(base_url: &str, admin_key: &str) -> Result<()> {
    let client = PoolClient::new(base_url, admin_key);
    let resp = client
        .request(reqwest::Method::GET, "/api/pool/status")
        .send()
        .await
        .context("sending pool status request")?;
    let body: serde_json::Value = resp.json().await.context("parsing pool status")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
