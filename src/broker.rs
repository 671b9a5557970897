use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ControlPlaneError;
use crate::events::AllowedUpstream;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredential {
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

/// The client-side contract for the credential broker. The broker itself
/// (identity, wallet, OAuth) is an external collaborator; this trait is the
/// narrow seam the pool manager and egress proxy call through, so both can
/// be exercised in tests against an in-memory fake.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn register_binding(
        &self,
        sandbox_id: &str,
        user_id: &str,
        allowed_upstreams: &[AllowedUpstream],
    ) -> Result<(), ControlPlaneError>;

    async fn deregister_binding(&self, sandbox_id: &str) -> Result<(), ControlPlaneError>;

    async fn issue_token(
        &self,
        sandbox_id: &str,
        upstream_host: &str,
        scopes: &[String],
    ) -> Result<IssuedToken, ControlPlaneError>;

    async fn git_credential(
        &self,
        sandbox_id: &str,
        host: &str,
    ) -> Result<GitCredential, ControlPlaneError>;
}

/// Production implementation, talking to the broker over HTTPS.
pub struct HttpBrokerClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBrokerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpBrokerClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct RegisterBindingBody<'a> {
    sandbox_id: &'a str,
    user_id: &'a str,
    allowed_upstreams: &'a [AllowedUpstream],
}

#[derive(Serialize)]
struct IssueTokenBody<'a> {
    sandbox_id: &'a str,
    upstream_host: &'a str,
    scopes: &'a [String],
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn register_binding(
        &self,
        sandbox_id: &str,
        user_id: &str,
        allowed_upstreams: &[AllowedUpstream],
    ) -> Result<(), ControlPlaneError> {
        let resp = self
            .http
            .post(format!("{}/api/bindings", self.base_url))
            .json(&RegisterBindingBody { sandbox_id, user_id, allowed_upstreams })
            .send()
            .await?;

        match resp.status().as_u16() {
            201 | 409 => Ok(()),
            code => Err(ControlPlaneError::Transient(format!(
                "broker returned {code} registering binding"
            ))),
        }
    }

    async fn deregister_binding(&self, sandbox_id: &str) -> Result<(), ControlPlaneError> {
        let resp = self
            .http
            .delete(format!("{}/api/bindings/{sandbox_id}", self.base_url))
            .send()
            .await?;
        match resp.status().as_u16() {
            204 | 404 => Ok(()),
            code => Err(ControlPlaneError::Transient(format!(
                "broker returned {code} deregistering binding"
            ))),
        }
    }

    async fn issue_token(
        &self,
        sandbox_id: &str,
        upstream_host: &str,
        scopes: &[String],
    ) -> Result<IssuedToken, ControlPlaneError> {
        let resp = self
            .http
            .post(format!("{}/api/token", self.base_url))
            .json(&IssueTokenBody { sandbox_id, upstream_host, scopes })
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => Ok(resp.json::<IssuedToken>().await?),
            403 => Err(ControlPlaneError::PolicyDenied(format!(
                "broker denied token for {upstream_host}"
            ))),
            429 => Err(ControlPlaneError::Transient("broker rate-limited token request".into())),
            code => Err(ControlPlaneError::Transient(format!(
                "broker returned {code} issuing token"
            ))),
        }
    }

    async fn git_credential(
        &self,
        sandbox_id: &str,
        host: &str,
    ) -> Result<GitCredential, ControlPlaneError> {
        let resp = self
            .http
            .get(format!(
                "{}/api/git-credential?sandbox_id={sandbox_id}&host={host}",
                self.base_url
            ))
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => Ok(resp.json::<GitCredential>().await?),
            404 => Err(ControlPlaneError::NotFound("no git credential for host".into())),
            code => Err(ControlPlaneError::Transient(format!(
                "broker returned {code} fetching git credential"
            ))),
        }
    }
}

/// An in-memory broker used by tests and local development so the pool
/// manager and proxy can be exercised without a real broker deployment.
pub struct FakeBrokerClient {
    pub bindings: dashmap::DashMap<String, Vec<AllowedUpstream>>,
}

impl FakeBrokerClient {
    pub fn new() -> Self {
        FakeBrokerClient { bindings: dashmap::DashMap::new() }
    }
}

impl Default for FakeBrokerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn register_binding(
        &self,
        sandbox_id: &str,
        _user_id: &str,
        allowed_upstreams: &[AllowedUpstream],
    ) -> Result<(), ControlPlaneError> {
        self.bindings
            .insert(sandbox_id.to_string(), allowed_upstreams.to_vec());
        Ok(())
    }

    async fn deregister_binding(&self, sandbox_id: &str) -> Result<(), ControlPlaneError> {
        self.bindings.remove(sandbox_id);
        Ok(())
    }

    async fn issue_token(
        &self,
        sandbox_id: &str,
        upstream_host: &str,
        _scopes: &[String],
    ) -> Result<IssuedToken, ControlPlaneError> {
        let binding = self.bindings.get(sandbox_id).ok_or_else(|| {
            ControlPlaneError::PolicyDenied(format!("no binding for sandbox {sandbox_id}"))
        })?;
        if !binding.iter().any(|u| u.host.eq_ignore_ascii_case(upstream_host)) {
            warn!(sandbox_id, upstream_host, "token_request_outside_binding");
            return Err(ControlPlaneError::PolicyDenied(format!(
                "{upstream_host} not in binding for {sandbox_id}"
            )));
        }
        Ok(IssuedToken {
            access_token: format!("fake-token-for-{upstream_host}"),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
        })
    }

    async fn git_credential(
        &self,
        _sandbox_id: &str,
        host: &str,
    ) -> Result<GitCredential, ControlPlaneError> {
        Ok(GitCredential {
            username: "x-access-token".to_string(),
            password: format!("fake-git-token-for-{host}"),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_broker_denies_unbound_host() {
        let broker = FakeBrokerClient::new();
        broker
            .register_binding(
                "sbx-1",
                "u1",
                &[AllowedUpstream { host: "graph.microsoft.com".into(), scopes: vec![] }],
            )
            .await
            .unwrap();

        let result = broker.issue_token("sbx-1", "evil.example.com", &[]).await;
        assert!(matches!(result, Err(ControlPlaneError::PolicyDenied(_))));
    }

    #[tokio::test]
    async fn fake_broker_issues_token_for_bound_host() {
        let broker = FakeBrokerClient::new();
        broker
            .register_binding(
                "sbx-1",
                "u1",
                &[AllowedUpstream { host: "graph.microsoft.com".into(), scopes: vec![] }],
            )
            .await
            .unwrap();

        let token = broker
            .issue_token("sbx-1", "graph.microsoft.com", &[])
            .await
            .unwrap();
        assert_eq!(token.token_type, "Bearer");
    }
}
