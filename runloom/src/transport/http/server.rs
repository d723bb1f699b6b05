//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::service::PredictionService;
use crate::shutdown::ShutdownController;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    /// Used in Kubernetes to allow graceful draining.
    pub await_explicit_shutdown: bool,
    /// How long to wait for in-flight predictions to drain, and for the
    /// worker to exit cleanly, before force-killing it.
    pub shutdown_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            await_explicit_shutdown: false,
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

/// Start the HTTP server with provided service.
pub async fn serve(config: ServerConfig, service: Arc<PredictionService>) -> anyhow::Result<()> {
    let controller = ShutdownController::new(config.shutdown_grace_period);
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting runloom server on {}", actual_addr);

    let wait_controller = controller.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_controller
                .wait_for_signal(config.await_explicit_shutdown, shutdown_rx)
                .await;
        })
        .await?;

    info!("Server shutdown complete");

    // Gracefully drain in-flight predictions, then stop the worker.
    controller.drain(&service).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert!(!config.await_explicit_shutdown);
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(30));
    }
}
