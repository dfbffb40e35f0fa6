//! SIGTERM/SIGINT wiring that drives a [`crate::shutdown::ShutdownOrchestrator`],
//! mirroring how this corpus's services wire a broadcast shutdown signal
//! (compare `fc-router::lifecycle::LifecycleManager::shutdown`) but sourced
//! from the process's own signal handlers instead of an internal health
//! check.

use tracing::info;

use crate::config::ShutdownOptions;
use crate::shutdown::ShutdownOrchestrator;

/// Awaits SIGTERM or SIGINT (Ctrl+C), then runs `orchestrator` and returns
/// its result. Intended to be raced against the rest of a service's
/// top-level future via `tokio::select!`.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Installs signal handling and, on receipt, runs `orchestrator`'s shutdown
/// sequence on its own task.
pub fn install(orchestrator: ShutdownOrchestrator, options: ShutdownOptions) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        if let Err(e) = orchestrator.run(options).await {
            tracing::error!(error = %e, "shutdown callback failed");
        }
    })
}
