use tokio::signal;
use tracing::{error, warn};

/// Current wall-clock time as whole seconds since the Unix epoch.
///
/// Rate-limit reset times are reported to clients in epoch seconds while
/// the window bookkeeping itself runs on the monotonic clock, so this is
/// the single place the two clocks meet.
pub fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Resolve when the process is asked to stop (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics when a signal handler cannot be installed, since the process
/// would otherwise be unstoppable from the inside.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {e}");
            panic!("signal handler installation failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                panic!("signal handler installation failed");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Ctrl+C received, draining in-flight requests"),
        _ = terminate => warn!("SIGTERM received, draining in-flight requests"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds_is_recent() {
        // Well past 2020-01-01 and not absurdly far in the future
        let now = epoch_seconds();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
