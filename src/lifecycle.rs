use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ControlPlaneError;
use crate::events::LifecycleEvent;
use crate::orchestrator::OrchestratorAdapter;
use crate::sandbox::ObservedPhase;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    pub pod_ready_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        LifecycleTimeouts {
            pod_ready_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Drives one sandbox from creation to `Ready`/`Failed`, pushing every
/// intermediate event onto `tx`. Exactly one terminal event is sent before
/// the channel is dropped.
pub async fn track(
    adapter: &OrchestratorAdapter,
    name: &str,
    timeouts: LifecycleTimeouts,
    tx: mpsc::Sender<LifecycleEvent>,
) -> Result<(), ControlPlaneError> {
    let _ = tx.send(LifecycleEvent::Created).await;

    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        if start.elapsed() > timeouts.pod_ready_timeout {
            let _ = tx
                .send(LifecycleEvent::Failed { reason: "timeout".into(), sandbox: None })
                .await;
            warn!(sandbox = name, "lifecycle_timeout");
            return Ok(());
        }

        attempt += 1;
        let sandbox = adapter.get_sandbox(name).await?;
        let sandbox = match sandbox {
            Some(s) => s,
            None => {
                let _ = tx
                    .send(LifecycleEvent::Failed { reason: "sandbox disappeared".into(), sandbox: None })
                    .await;
                return Ok(());
            }
        };

        if sandbox.phase == ObservedPhase::Failed {
            let _ = tx
                .send(LifecycleEvent::Failed {
                    reason: "pod phase failed".into(),
                    sandbox: Some(sandbox.info()),
                })
                .await;
            return Ok(());
        }

        if sandbox.phase != ObservedPhase::Running || !sandbox.is_ready || sandbox.pod_ip.is_none() {
            let _ = tx
                .send(LifecycleEvent::Waiting {
                    attempt,
                    phase: format!("{:?}", sandbox.phase),
                    message: None,
                })
                .await;
            tokio::time::sleep(timeouts.poll_interval).await;
            continue;
        }

        match probe_health(&sandbox, timeouts.probe_timeout).await {
            Ok(()) => {
                let _ = tx.send(LifecycleEvent::HealthCheck { healthy: true, ip: sandbox.pod_ip.clone(), message: None }).await;
                let elapsed = start.elapsed().as_secs_f64();
                info!(sandbox = name, elapsed_seconds = elapsed, "sandbox_ready");
                let _ = tx
                    .send(LifecycleEvent::Ready { sandbox: sandbox.info(), elapsed_seconds: elapsed })
                    .await;
                return Ok(());
            }
            Err(message) => {
                let _ = tx
                    .send(LifecycleEvent::HealthCheck {
                        healthy: false,
                        ip: sandbox.pod_ip.clone(),
                        message: Some(message),
                    })
                    .await;
                tokio::time::sleep(timeouts.poll_interval).await;
            }
        }
    }
}

/// One-shot readiness check used by the warm-pool promotion loop (the
/// `watch` role): fetches `name`, and returns `Ready(sandbox)` once phase,
/// pod IP and the executor healthcheck all agree, `Waiting` while still
/// provisioning, or `Failed` on a terminal pod phase. Never blocks beyond
/// `probe_timeout` — callers poll this on their own interval rather than
/// looping internally, since promotion has no single in-flight caller to
/// stream events back to.
pub enum ReadinessOutcome {
    Ready(crate::sandbox::Sandbox),
    Waiting,
    Failed(String),
    Gone,
}

pub async fn check_ready(
    adapter: &OrchestratorAdapter,
    name: &str,
    probe_timeout: Duration,
) -> Result<ReadinessOutcome, ControlPlaneError> {
    let Some(sandbox) = adapter.get_sandbox(name).await? else {
        return Ok(ReadinessOutcome::Gone);
    };

    if sandbox.phase == ObservedPhase::Failed {
        return Ok(ReadinessOutcome::Failed("pod phase failed".into()));
    }
    if sandbox.phase != ObservedPhase::Running || !sandbox.is_ready || sandbox.pod_ip.is_none() {
        return Ok(ReadinessOutcome::Waiting);
    }
    match probe_health(&sandbox, probe_timeout).await {
        Ok(()) => Ok(ReadinessOutcome::Ready(sandbox)),
        Err(_) => Ok(ReadinessOutcome::Waiting),
    }
}

/// Hits the executor contract's `/healthz` at the sandbox's pod IP. A
/// non-2xx or unreachable endpoint is treated as "not yet ready", never as
/// a fatal error — only the overall timeout terminates tracking.
async fn probe_health(sandbox: &crate::sandbox::Sandbox, timeout: Duration) -> Result<(), String> {
    let ip = sandbox.pod_ip.as_ref().ok_or_else(|| "no pod ip".to_string())?;
    let url = format!("http://{ip}:8080/healthz");
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| e.to_string())?;
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(format!("probe returned {}", resp.status())),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_are_within_spec_ranges() {
        let t = LifecycleTimeouts::default();
        assert!(t.pod_ready_timeout.as_secs() >= 30 && t.pod_ready_timeout.as_secs() <= 300);
    }

    #[tokio::test]
    async fn terminal_event_is_last_for_missing_sandbox() {
        // Exercises the "sandbox disappeared" branch's event shape directly,
        // since standing up a fake orchestrator adapter is out of scope for
        // a unit test at this layer (covered at the gateway integration
        // level instead).
        let (tx, mut rx) = mpsc::channel(8);
        let _ = tx
            .send(LifecycleEvent::Failed { reason: "sandbox disappeared".into(), sandbox: None })
            .await;
        drop(tx);
        let ev = rx.recv().await.unwrap();
        assert!(ev.is_terminal());
        assert!(rx.recv().await.is_none());
    }
}
