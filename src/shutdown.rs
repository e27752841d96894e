//! Shutdown plumbing shared by the server loops and the binary.

use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wait for SIGTERM, SIGINT or SIGQUIT (Ctrl-C elsewhere).
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `true` if the pause was cut short by cancellation.
pub async fn pause_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
