use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandboxd")]
#[command(about = "Control plane for VM-isolated sandbox containers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Kubernetes namespace the control plane operates in.
    #[arg(long, global = true, default_value = "sandboxes")]
    pub namespace: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check orchestrator connectivity and RBAC permissions.
    Check,

    /// Serve the request gateway (C6): allocate, execute, query, delete,
    /// pool status, streamed as server-sent events.
    Gateway {
        #[arg(long, default_value = "0.0.0.0:8081")]
        addr: String,
        /// Path to a file containing the admin shared-secret.
        #[arg(long)]
        admin_key_file: String,
        #[arg(long)]
        broker_url: String,
        #[arg(long, default_value_t = 4)]
        warm: u32,
        #[arg(long, default_value_t = 32)]
        max_total: u32,
        /// Serve HTTPS with this certificate instead of plain HTTP. Requires
        /// --tls-key.
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<String>,
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<String>,
    },

    /// Serve the egress proxy sidecar (C7): CONNECT handling, domain
    /// policy, TLS interception and credential injection.
    Proxy {
        #[arg(long, default_value = "127.0.0.1:8080")]
        proxy_addr: String,
        #[arg(long, default_value = "127.0.0.1:8082")]
        admin_addr: String,
        #[arg(long)]
        policy_file: String,
        #[arg(long)]
        ca_cert: Option<String>,
        #[arg(long)]
        ca_key: Option<String>,
        #[arg(long)]
        broker_url: String,
        #[arg(long)]
        sandbox_id: String,
    },

    /// Run the back-fill and cleanup loops (C3, C5), back-fill gated
    /// behind a cluster-wide lease.
    Reconcile {
        #[arg(long, default_value = "127.0.0.1:8083")]
        admin_addr: String,
        #[arg(long)]
        broker_url: String,
        #[arg(long)]
        warm_spec_file: String,
        #[arg(long, default_value_t = 4)]
        warm: u32,
        #[arg(long, default_value_t = 32)]
        max_total: u32,
        /// Seconds between back-fill ticks [10, 300].
        #[arg(long, default_value_t = 15)]
        backfill_interval_secs: u64,
        /// Seconds between cleanup sweeps [60, 3600].
        #[arg(long, default_value_t = 60)]
        cleanup_interval_secs: u64,
        /// Seconds of inactivity before an allocated sandbox is reclaimed
        /// [60, 86400].
        #[arg(long, default_value_t = 1800)]
        idle_timeout_secs: u64,
        /// Seconds since allocation before a sandbox is reclaimed
        /// regardless of activity [60, 86400].
        #[arg(long, default_value_t = 14400)]
        max_lifetime_secs: u64,
    },

    /// Run the warm-pool promotion loop (C4 for back-fill-created
    /// sandboxes with no caller awaiting a lifecycle stream).
    Watch {
        #[arg(long, default_value = "127.0.0.1:8084")]
        admin_addr: String,
        /// Seconds between readiness polls [1, 30].
        #[arg(long, default_value_t = 2)]
        poll_interval_secs: u64,
        /// Seconds before a still-provisioning sandbox is deleted rather
        /// than promoted [30, 300].
        #[arg(long, default_value_t = 120)]
        pod_ready_timeout_secs: u64,
    },

    /// Administrative client for the pool's public surface (§6), talking
    /// to a running gateway over HTTP.
    Pool {
        #[arg(long, default_value = "http://127.0.0.1:8081")]
        gateway_url: String,
        /// Path to a file containing the admin shared-secret.
        #[arg(long)]
        admin_key_file: String,
        #[command(subcommand)]
        action: PoolAction,
    },
}

#[derive(Subcommand)]
pub enum PoolAction {
    /// Allocate a warm sandbox (falling back to on-demand creation),
    /// streaming lifecycle events.
    Allocate {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "executor")]
        kind: String,
    },
    /// Create a sandbox directly from a spec file, streaming lifecycle
    /// events.
    Create {
        #[arg(long)]
        spec_file: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Fetch one sandbox's public info.
    Get { name: String },
    /// List every sandbox's public info.
    List,
    /// Delete one sandbox.
    Delete { name: String },
    /// Delete every sandbox known to the gateway.
    DeleteAll,
    /// Run a command inside a sandbox, streaming execution events.
    Execute {
        name: String,
        command: String,
        #[arg(long, default_value_t = 300)]
        timeout_seconds: u32,
    },
    /// Print the pool's utilization report.
    Status,
}

/// Validates the bounded timeout ranges named in §5. Out-of-range values
/// are a `Fatal` startup error, not a silent clamp.
pub fn validate_timeouts(cli: &Cli) -> anyhow::Result<()> {
    if let Commands::Reconcile {
        backfill_interval_secs,
        cleanup_interval_secs,
        idle_timeout_secs,
        max_lifetime_secs,
        ..
    } = &cli.command
    {
        check_range("backfill-interval-secs", *backfill_interval_secs, 10, 300)?;
        check_range("cleanup-interval-secs", *cleanup_interval_secs, 60, 3600)?;
        check_range("idle-timeout-secs", *idle_timeout_secs, 60, 86_400)?;
        check_range("max-lifetime-secs", *max_lifetime_secs, 60, 86_400)?;
    }
    if let Commands::Watch { poll_interval_secs, pod_ready_timeout_secs, .. } = &cli.command {
        check_range("poll-interval-secs", *poll_interval_secs, 1, 30)?;
        check_range("pod-ready-timeout-secs", *pod_ready_timeout_secs, 30, 300)?;
    }
    Ok(())
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> anyhow::Result<()> {
    if value < min || value > max {
        anyhow::bail!("--{name} must be between {min} and {max}, got {value}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_backfill_interval() {
        let cli = Cli {
            namespace: "sandboxes".into(),
            command: Commands::Reconcile {
                admin_addr: "127.0.0.1:0".into(),
                broker_url: "http://broker".into(),
                warm_spec_file: "spec.yaml".into(),
                warm: 4,
                max_total: 32,
                backfill_interval_secs: 5,
                cleanup_interval_secs: 60,
                idle_timeout_secs: 1800,
                max_lifetime_secs: 14400,
            },
        };
        assert!(validate_timeouts(&cli).is_err());
    }

    #[test]
    fn accepts_default_reconcile_timeouts() {
        let cli = Cli {
            namespace: "sandboxes".into(),
            command: Commands::Reconcile {
                admin_addr: "127.0.0.1:0".into(),
                broker_url: "http://broker".into(),
                warm_spec_file: "spec.yaml".into(),
                warm: 4,
                max_total: 32,
                backfill_interval_secs: 15,
                cleanup_interval_secs: 60,
                idle_timeout_secs: 1800,
                max_lifetime_secs: 14400,
            },
        };
        assert!(validate_timeouts(&cli).is_ok());
    }
}
