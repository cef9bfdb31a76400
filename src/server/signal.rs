// Signal handling module
//
// Supported signals:
// - SIGTERM: Graceful shutdown
// - SIGINT:  Graceful shutdown (Ctrl+C)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::logger;

/// Stop request shared between a server loop and whoever may end it
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    /// Whether a stop has been requested
    requested: Arc<AtomicBool>,
    /// Wakes async waiters
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The loop notices within one poll timeout.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once `stop` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Start signal handlers (Unix only)
///
/// Spawns a background task that triggers `stop` on the first
/// SIGTERM or SIGINT.
///
/// | Signal  | Action        |
/// |---------|---------------|
/// | SIGTERM | Graceful stop |
/// | SIGINT  | Graceful stop |
#[cfg(unix)]
pub fn start_signal_handler(stop: StopHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    logger::log_error(&format!("Failed to register signal handlers: {e}"));
                    return;
                }
            };

        tracing::debug!("[SIGNAL] Handlers registered, process id {}", std::process::id());

        tokio::select! {
            _ = sigterm.recv() => logger::log_signal("SIGTERM"),
            _ = sigint.recv() => logger::log_signal("SIGINT"),
            () = stop.stopped() => return,
        }
        stop.stop();
    });
}

/// Windows fallback - only handles Ctrl+C
#[cfg(not(unix))]
pub fn start_signal_handler(stop: StopHandle) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    logger::log_signal("Ctrl+C");
                    stop.stop();
                }
            }
            () = stop.stopped() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_flag() {
        let stop = StopHandle::new();
        let other = stop.clone();
        assert!(!stop.is_stopped());
        other.stop();
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_resolves() {
        let stop = StopHandle::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.stop();
        });
        tokio::time::timeout(Duration::from_secs(2), stop.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_after_stop() {
        let stop = StopHandle::new();
        stop.stop();
        stop.stopped().await;
    }
}
