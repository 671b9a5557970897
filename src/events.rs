use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxInfo;

/// One record in the `Created -> .. -> Ready|Failed` sequence emitted while a
/// sandbox is provisioned. Exactly one of `Ready`/`Failed` terminates the
/// sequence; see `Ready`/`Failed` docs on `LifecycleTracker`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "camelCase")]
pub enum LifecycleEvent {
    Created,
    Waiting {
        attempt: u32,
        phase: String,
        message: Option<String>,
    },
    HealthCheck {
        healthy: bool,
        ip: Option<String>,
        message: Option<String>,
    },
    Ready {
        sandbox: SandboxInfo,
        elapsed_seconds: f64,
    },
    Failed {
        reason: String,
        sandbox: Option<SandboxInfo>,
    },
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::Ready { .. } | LifecycleEvent::Failed { .. })
    }
}

/// One record in the `Output* -> Completed` sequence emitted while a sandbox
/// runs a command via the executor contract. Mirrors the executor's own
/// `$type`-tagged wire format so events can be relayed without re-encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum ExecutionEvent {
    OutputEvent {
        pid: u32,
        stream: OutputStream,
        data: String,
    },
    CompletedEvent {
        pid: u32,
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(rename = "timedOut")]
        timed_out: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How the egress proxy should treat connections to one upstream host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Mitm,
    Passthrough,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostPolicy {
    pub mode: PolicyMode,
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
}

/// `host -> policy`, matched by exact case-insensitive host; no match means
/// `deny`. Loaded from a flat JSON/YAML file at proxy startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainPolicy(HashMap<String, HostPolicy>);

impl DomainPolicy {
    pub fn new(map: HashMap<String, HostPolicy>) -> Self {
        let lowered = map
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        DomainPolicy(lowered)
    }

    pub fn lookup(&self, host: &str) -> HostPolicy {
        self.0
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or(HostPolicy {
                mode: PolicyMode::Deny,
                allowed_scopes: Vec::new(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedUpstream {
    pub host: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A sandbox-to-user binding registered with the credential broker on
/// allocation. Owned by the broker; this is the wire shape the control plane
/// sends and the sidecar reasons about locally while it has one cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxBinding {
    pub sandbox_id: String,
    pub user_id: String,
    pub allowed_upstreams: Vec<AllowedUpstream>,
    pub created_at: DateTime<Utc>,
}

/// An upstream access token cached by the egress proxy, keyed by
/// `(upstream, scopes)`. The value is never logged or persisted.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub upstream: String,
    pub scopes: Vec<String>,
    pub value: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Proactive refresh triggers at 80% of the token's lifetime.
    pub fn needs_refresh(&self, now: DateTime<Utc>, issued_at: DateTime<Utc>) -> bool {
        let total = (self.expires_at - issued_at).num_milliseconds().max(1) as f64;
        let elapsed = (now - issued_at).num_milliseconds() as f64;
        elapsed / total >= 0.8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_event_serializes_with_tag() {
        let ev = LifecycleEvent::Waiting {
            attempt: 1,
            phase: "Pending".into(),
            message: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "Waiting");
        assert_eq!(json["attempt"], 1);
    }

    #[test]
    fn ready_and_failed_are_terminal() {
        let sandbox = SandboxInfo::default();
        assert!(LifecycleEvent::Ready { sandbox: sandbox.clone(), elapsed_seconds: 1.0 }.is_terminal());
        assert!(LifecycleEvent::Failed { reason: "x".into(), sandbox: None }.is_terminal());
        assert!(!LifecycleEvent::Created.is_terminal());
    }

    #[test]
    fn domain_policy_lookup_is_case_insensitive_and_defaults_deny() {
        let mut m = HashMap::new();
        m.insert(
            "Graph.Microsoft.Com".to_string(),
            HostPolicy { mode: PolicyMode::Mitm, allowed_scopes: vec!["X".into()] },
        );
        let policy = DomainPolicy::new(m);
        assert_eq!(policy.lookup("graph.microsoft.com").mode, PolicyMode::Mitm);
        assert_eq!(policy.lookup("unknown.example.com").mode, PolicyMode::Deny);
    }

    #[test]
    fn execution_event_round_trips_through_json() {
        let ev = ExecutionEvent::CompletedEvent { pid: 42, exit_code: 0, timed_out: false };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
