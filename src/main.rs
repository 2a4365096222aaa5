//! comfy-gateway entry point

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfy_gateway::{
    config::Args,
    context::SystemContext,
    health, metrics, scheduler, server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("comfy_gateway={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    let worker_hosts = args.worker_host_list();
    info!("======================================");
    info!("  Comfy Gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Upstream TLS: {}", args.use_tls);
    info!("Workers: {}", worker_hosts.len());
    for (i, host) in worker_hosts.iter().enumerate() {
        info!("  worker-{}: {}", i, host);
    }
    info!(
        "Concurrency: {} global, {} per worker, {} streams per worker",
        args.max_concurrent_global, args.max_jobs_per_worker, args.max_streams_per_worker
    );
    info!(
        "Timeouts: execution {}s, job {}s, retention {}s",
        args.execution_timeout_secs, args.job_timeout_secs, args.terminal_retention_secs
    );
    info!("======================================");

    // Wire up the component graph
    let ctx = Arc::new(SystemContext::new(args.clone()));

    // Background health probing for every worker
    let _probe_handle = health::spawn_probe_task(Arc::clone(&ctx.health));

    // Dispatch loop
    let _scheduler_handle = scheduler::spawn_scheduler(Arc::clone(&ctx));

    // Optional periodic metrics snapshots
    let metrics_path = args.metrics_file_path.as_ref().map(std::path::PathBuf::from);
    let _metrics_handle = metrics_path.clone().map(|path| {
        metrics::spawn_save_task(
            Arc::clone(&ctx.metrics),
            path,
            std::time::Duration::from_secs(args.metrics_save_interval_secs),
        )
    });

    // Serve until SIGINT, then drain
    let server_ctx = Arc::clone(&ctx);
    tokio::select! {
        result = server::run(server_ctx) => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Stop accepting work, let in-flight jobs finish, close the pools
    scheduler::shutdown(
        &ctx,
        std::time::Duration::from_secs(args.graceful_shutdown_secs),
    )
    .await;
    ctx.pools.close_all().await;

    // One final snapshot attempt
    if let Some(path) = metrics_path {
        if let Err(e) = ctx.metrics.save_to_file(&path).await {
            warn!("Final metrics snapshot failed: {e}");
        }
    }

    info!("Gateway stopped");
    Ok(())
}
