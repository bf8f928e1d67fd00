//! Shutdown signal handling shared by service binaries

use tracing::warn;

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Wait for Ctrl+C, or SIGTERM on Unix
///
/// When the SIGTERM handler cannot be installed only Ctrl+C is honoured.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                    _ = term.recv() => ShutdownSignal::Terminate,
                }
            },
            Err(e) => {
                warn!("SIGTERM handler unavailable ({}), waiting for Ctrl+C only", e);
                let _ = tokio::signal::ctrl_c().await;
                ShutdownSignal::Interrupt
            },
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl+C handler failed: {}", e);
        }
        ShutdownSignal::Interrupt
    }
}
