use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hangar::config::GlobalConfig;
use hangar::ipc::IPCServer;
use hangar::supervisor::scheduler::AutoRestartScheduler;
use hangar::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Hangar daemon starting");

    let cfg = GlobalConfig::load()?;
    let supervisor = Arc::new(Supervisor::from_config(&cfg));
    if let Err(e) = supervisor.load().await {
        tracing::error!("Failed to load server registry from {}: {}", cfg.db_file.display(), e);
    }

    let shutdown = CancellationToken::new();

    let scheduler = AutoRestartScheduler::new(supervisor.clone(), cfg.scheduler_tick());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    // Ctrl+C: stop accepting requests and the scheduler; servers are cleaned up below.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received, cleaning up...");
        signal_token.cancel();
    });

    let ipc_server = IPCServer::new(supervisor.clone(), &cfg.listen_addr);
    if let Err(e) = ipc_server.start(shutdown.clone()).await {
        tracing::error!("IPC server error: {}", e);
    }

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }
    supervisor.shutdown().await;

    tracing::info!("Hangar daemon shut down");
    Ok(())
}
