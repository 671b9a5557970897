mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, PoolAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli::validate_timeouts(&cli) {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Check => commands::check::run(&cli.namespace).await,
        Commands::Gateway { addr, admin_key_file, broker_url, warm, max_total, tls_cert, tls_key } => {
            commands::gateway::serve(
                &addr,
                &cli.namespace,
                &admin_key_file,
                &broker_url,
                warm,
                max_total,
                tls_cert.as_deref(),
                tls_key.as_deref(),
            )
            .await
        }
        Commands::Proxy { proxy_addr, admin_addr, policy_file, ca_cert, ca_key, broker_url, sandbox_id } => {
            commands::proxy::serve(
                &proxy_addr,
                &admin_addr,
                &policy_file,
                ca_cert.as_deref(),
                ca_key.as_deref(),
                &broker_url,
                &sandbox_id,
            )
            .await
        }
        Commands::Reconcile {
            admin_addr,
            broker_url,
            warm_spec_file,
            warm,
            max_total,
            backfill_interval_secs,
            cleanup_interval_secs,
            idle_timeout_secs,
            max_lifetime_secs,
        } => {
            commands::reconcile::run(
                &cli.namespace,
                &admin_addr,
                &broker_url,
                &warm_spec_file,
                warm,
                max_total,
                backfill_interval_secs,
                cleanup_interval_secs,
                idle_timeout_secs,
                max_lifetime_secs,
            )
            .await
        }
        Commands::Watch { admin_addr, poll_interval_secs, pod_ready_timeout_secs } => {
            commands::watch::run(&cli.namespace, &admin_addr, poll_interval_secs, pod_ready_timeout_secs).await
        }
        Commands::Pool { gateway_url, admin_key_file, action } => {
            run_pool_action(&gateway_url, &admin_key_file, action).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_pool_action(gateway_url: &str, admin_key_file: &str, action: PoolAction) -> anyhow::Result<()> {
    let admin_key = std::fs::read_to_string(admin_key_file)?.trim().to_string();
    match action {
        PoolAction::Allocate { user_id, kind } => {
            commands::pool::allocate(gateway_url, &admin_key, &user_id, &kind).await
        }
        PoolAction::Create { spec_file, user_id } => {
            commands::pool::create(gateway_url, &admin_key, &spec_file, user_id.as_deref()).await
        }
        PoolAction::Get { name } => commands::pool::get(gateway_url, &admin_key, &name).await,
        PoolAction::List => commands::pool::list(gateway_url, &admin_key).await,
        PoolAction::Delete { name } => commands::pool::delete(gateway_url, &admin_key, &name).await,
        PoolAction::DeleteAll => commands::pool::delete_all(gateway_url, &admin_key).await,
        PoolAction::Execute { name, command, timeout_seconds } => {
            commands::pool::execute(gateway_url, &admin_key, &name, &command, timeout_seconds).await
        }
        PoolAction::Status => commands::pool::status(gateway_url, &admin_key).await,
    }
}
