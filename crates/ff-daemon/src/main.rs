//! ff-daemon: runs the scheduling loop and serves the dashboard API.

use std::sync::Arc;

use anyhow::{Context, Result};
use ff_agents::CommandWorker;
use ff_core::config::Config;
use ff_daemon::daemon::Daemon;
use ff_daemon::shutdown::ShutdownReason;
use ff_telemetry::logging::LogFormat;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    ff_telemetry::logging::init(
        LogFormat::from_config(&config.general.log_format),
        "ff-daemon",
        &config.general.log_level,
    );
    info!(
        project = %config.general.project_name,
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "ff-daemon starting"
    );

    if config.worker.command.trim().is_empty() {
        warn!("no [worker].command configured, every run will fail until one is set");
    }
    let worker = Arc::new(CommandWorker::new(&config.worker));
    let api_addr = config.daemon.bind_addr();
    let daemon = Daemon::new(config, worker).await?;

    // Wire ctrl-c to trigger graceful shutdown.
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger(ShutdownReason::Operator);
    });

    info!("API server: http://{api_addr}");
    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}
