use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use ferry_store::Store;

/// Escalating graceful-shutdown controller.
///
/// Tier 1 (first signal): stop accepting new events, let in-flight dispatch
/// drain, close the store, exit 0.
/// Tier 2 (second signal or the drain timer): additionally cancel in-flight
/// network calls, close the store once work unwinds, exit 0.
/// Tier 3 (further signal or the cancel timer): force-close the store under
/// in-flight work and exit non-zero; the latest writes may be lost.
///
/// The store is closed exactly once on every exit path. Transitions only
/// move forward, so repeated signals are safe at any point.
pub struct Controller {
    store: Arc<Store>,
    /// Fired by the dispatcher on store corruption; treated like a signal.
    fatal: CancellationToken,
    /// Cancelled in tier 1: intake loops stop delivering events.
    intake: CancellationToken,
    /// Cancelled in tier 2: outbound network calls abort.
    net: CancellationToken,
    /// Tracks one task per in-flight inbound event.
    tracker: TaskTracker,
    drain_timeout: Duration,
    cancel_timeout: Duration,
}

impl Controller {
    pub fn new(
        store: Arc<Store>,
        fatal: CancellationToken,
        intake: CancellationToken,
        net: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            store,
            fatal,
            intake,
            net,
            tracker,
            drain_timeout: Duration::from_secs(60),
            cancel_timeout: Duration::from_secs(240),
        }
    }

    #[cfg(test)]
    fn with_timeouts(mut self, drain: Duration, cancel: Duration) -> Self {
        self.drain_timeout = drain;
        self.cancel_timeout = cancel;
        self
    }

    /// Block until shutdown completes. Returns the process exit code.
    pub async fn run(self, mut signals: mpsc::Receiver<&'static str>) -> i32 {
        tokio::select! {
            reason = signals.recv() => {
                info!(reason = reason.unwrap_or("signal channel closed"), "shutdown requested");
            }
            _ = self.fatal.cancelled() => {
                error!("store corruption reported, shutting down");
            }
        }

        // Tier 1: no new events; drain what is already dispatched.
        info!("tier 1: stopped intake, draining in-flight work");
        self.intake.cancel();
        self.tracker.close();
        tokio::select! {
            _ = self.tracker.wait() => {
                info!("in-flight work drained");
                return self.close_store(0);
            }
            reason = signals.recv() => {
                warn!(reason = reason.unwrap_or(""), "second signal during drain");
            }
            _ = sleep(self.drain_timeout) => {
                warn!("drain timed out");
            }
        }

        // Tier 2: abort outbound network calls, then let tasks unwind.
        warn!("tier 2: cancelling in-flight network calls");
        self.net.cancel();
        tokio::select! {
            _ = self.tracker.wait() => {
                info!("in-flight work unwound after cancellation");
                return self.close_store(0);
            }
            reason = signals.recv() => {
                warn!(reason = reason.unwrap_or(""), "further signal during cancellation");
            }
            _ = sleep(self.cancel_timeout) => {
                warn!("cancellation timed out");
            }
        }

        // Tier 3: give up on in-flight work; the latest writes may be lost.
        error!("tier 3: force-closing the store");
        self.close_store(1)
    }

    fn close_store(&self, code: i32) -> i32 {
        if !self.store.close() {
            // Double-close would mean a second exit path ran; that is a bug
            // worth a loud exit.
            error!("store was already closed");
            return 1;
        }
        code
    }
}

/// Forward SIGINT/SIGTERM into the controller's signal channel. Each
/// delivery escalates one tier.
pub fn listen_for_signals(tx: mpsc::Sender<&'static str>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
            loop {
                let reason = tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                };
                if tx.send(reason).await.is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if tx.send("ctrl-c").await.is_err() {
                    return;
                }
            }
        }
    });
}
