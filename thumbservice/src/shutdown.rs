use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `shutdown` on the first SIGINT/SIGTERM, then `abort` once `grace`
/// has elapsed or a second signal arrives.
pub async fn watch(
    shutdown: CancellationToken,
    abort: CancellationToken,
    grace: Duration,
) {
    termination().await;
    info!("Shutdown requested; finishing the current poll");
    shutdown.cancel();

    tokio::select! {
        _ = tokio::time::sleep(grace) => {
            warn!(
                "Shutdown grace period of {grace:?} elapsed; \
                 aborting conversions"
            );
        }
        _ = termination() => {
            warn!("Second termination signal; aborting conversions");
        }
    }
    abort.cancel();
}

async fn termination() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
