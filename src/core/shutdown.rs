use tokio::signal;
use tokio::sync::watch;

pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

/// Waits for a signal, then tells every session driver to persist and stop.
/// Drivers go first so long-polling requests resolve before the server drains.
pub(crate) async fn broadcast_on_signal(drivers: watch::Sender<bool>) {
    shutdown_signal().await;
    if drivers.send(true).is_err() {
        tracing::warn!("No background tasks left to notify of shutdown");
    }
}
