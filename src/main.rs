//! sandbox-execd
//!
//! HTTP daemon that runs untrusted scripts inside isolated, resource-bounded
//! containers and returns captured output via a polling handle.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sandbox_execd::config::Config;
use sandbox_execd::executor::Executor;
use sandbox_execd::http::{self, AppState};
use sandbox_execd::pool::PrewarmPool;
use sandbox_execd::reaper::CleanupReaper;
use sandbox_execd::runtime::{DockerRuntime, ResourceLimits, SandboxRuntime};
use sandbox_execd::session::SessionTable;

#[derive(Parser, Debug)]
#[command(name = "sandbox-execd")]
#[command(about = "Sandboxed script execution daemon")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Path to a JSON config file (env overrides apply on top of defaults
    /// when omitted)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path).context("Failed to load configuration")?,
        None => Config::from_env(),
    };

    info!(
        image = %config.container_image,
        pool_target = config.pool_target_size,
        exec_timeout_secs = config.exec_timeout_seconds,
        "Loaded configuration"
    );

    let runtime: Arc<dyn SandboxRuntime> = Arc::new(
        DockerRuntime::connect(config.container_image.clone())
            .context("Failed to connect to the container engine")?,
    );

    let pool = PrewarmPool::new(
        runtime.clone(),
        ResourceLimits::from(&config),
        config.pool_target_size,
    );
    let sessions = Arc::new(SessionTable::new());
    let executor = Executor::new(runtime.clone(), pool.clone(), sessions.clone(), &config);
    let reaper = CleanupReaper::new(runtime.clone(), pool.clone(), sessions.clone(), &config);

    // Warm the pool before accepting work, then keep it topped up
    let prewarmed = pool.replenish().await;
    info!(prewarmed, "Initial prewarm pass done");
    let reaper_task = reaper.start();

    let state = AppState {
        executor,
        sessions,
        pool: pool.clone(),
        reaper,
    };
    http::serve(state, args.port).await?;

    // Drain the pool so no warm container outlives the daemon
    reaper_task.abort();
    for sandbox in pool.drain() {
        if let Err(e) = runtime.stop(&sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "Failed to stop sandbox during shutdown");
        }
        if let Err(e) = runtime.remove(&sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "Failed to remove sandbox during shutdown");
        }
    }
    info!("Shutdown complete");

    Ok(())
}
