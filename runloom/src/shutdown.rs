//! Graceful shutdown controller.
//!
//! Coordinates the sequence a triggered shutdown runs through: start
//! rejecting new admissions immediately, wait for in-flight predictions to
//! drain (cancel requests stay accepted throughout), signal every worker to
//! stop, then force-kill anything still alive after a grace period.
//!
//! Grounded on `transport::http::server`'s original inlined
//! `shutdown_signal` future, generalized so the signal-waiting half and the
//! drain-and-kill half can be driven independently of the HTTP transport.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use crate::service::PredictionService;

/// What woke the shutdown wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    Terminate,
    Explicit,
}

/// Owns the watch channel transports subscribe to, plus the grace period
/// applied once a drain starts.
#[derive(Clone)]
pub struct ShutdownController {
    grace_period: Duration,
}

impl ShutdownController {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Wait for SIGINT, SIGTERM (unless `await_explicit_shutdown`), or an
    /// explicit trigger on `shutdown_rx` (the `/shutdown` endpoint flips it).
    ///
    /// # Panics
    /// Panics if a signal handler cannot be installed - an unrecoverable
    /// configuration error that should fail fast at startup.
    pub async fn wait_for_signal(
        &self,
        await_explicit_shutdown: bool,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> ShutdownReason {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect(
                "failed to install Ctrl+C handler - is tokio runtime configured correctly?",
            );
        };

        #[cfg(unix)]
        let terminate = async {
            if await_explicit_shutdown {
                tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
                std::future::pending::<()>().await
            } else {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect(
                        "failed to install SIGTERM handler - is tokio runtime configured correctly?",
                    )
                    .recv()
                    .await;
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let explicit_shutdown = async {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT, shutting down...");
                ShutdownReason::CtrlC
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down...");
                ShutdownReason::Terminate
            }
            _ = explicit_shutdown => {
                info!("Shutdown requested via /shutdown endpoint...");
                ShutdownReason::Explicit
            }
        }
    }

    /// Run the drain sequence against `service`: trigger rejection of new
    /// admissions (`set_health`/transport checks `health().is_ready()`
    /// elsewhere), poll until every slot is free or the grace period
    /// elapses, signal the worker to shut down, then force-kill if it's
    /// still alive.
    ///
    /// Cancel requests remain accepted throughout - nothing here blocks
    /// `PredictionService::cancel()`.
    pub async fn drain(&self, service: &PredictionService) {
        service.trigger_shutdown();

        let deadline = Instant::now() + self.grace_period;
        loop {
            let health = service.health().await;
            if health.total_slots == 0 || health.available_slots == health.total_slots {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Shutdown grace period elapsed with predictions still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        service.shutdown().await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining > Duration::ZERO {
            tokio::time::sleep(remaining).await;
        }

        tracing::info!("Force-killing worker if still alive after grace period");
        service.force_kill().await;
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}
