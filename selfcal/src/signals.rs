//! Translate SIGINT / SIGTERM into run cancellation.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Cancel `token` on the first SIGINT or SIGTERM. The task exits early if the
/// token is cancelled some other way.
pub fn install_shutdown_handler(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = tokio::select! {
            name = wait_for_interrupt() => name,
            name = wait_for_terminate() => name,
            _ = token.cancelled() => return,
        };
        warn!("{signal} received, shutting down");
        token.cancel();
    })
}

async fn wait_for_interrupt() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for SIGINT: {e}");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(unix)]
async fn wait_for_terminate() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {e}");
            std::future::pending::<()>().await;
        }
    }
    "SIGTERM"
}

#[cfg(not(unix))]
async fn wait_for_terminate() -> &'static str {
    std::future::pending::<()>().await;
    "SIGTERM"
}
