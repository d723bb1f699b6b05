//! Thin bootstrap binary: reads configuration from the environment, brings
//! up either a fixed-mode or dynamic-mode worker, and runs the HTTP server
//! until shutdown. No CLI flags - the outer CLI/YAML config layer is out of
//! scope, so everything is environment-driven (`runloom::config::Config`).

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use runloom::config::Config;
use runloom::io::output::OutputUploader;
use runloom::orchestrator::{self, OrchestratorConfig};
use runloom::permit::PermitPool;
use runloom::scheduler::dynamic::{DynamicScheduler, DynamicWorkerSpawner, SchedulerError};
use runloom::transport::{self, ServerConfig};
use runloom::{Health, Orchestrator, PredictionService, SetupLogAccumulator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (setup_log_tx, mut setup_log_rx) = tokio::sync::mpsc::unbounded_channel();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(SetupLogAccumulator::new(setup_log_tx))
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(version = runloom::RUNLOOM_VERSION, "starting runloom server");

    let service = Arc::new(
        PredictionService::new_no_pool()
            .with_working_directory(config.working_directory.clone())
            .with_upload_prefix(config.upload_url.clone()),
    );
    service.set_health(Health::Starting).await;

    if config.max_runners > 0 {
        start_dynamic(&service, &config).await?;
    } else {
        start_fixed(&service, &config, &mut setup_log_rx).await?;
    }

    let server_config = ServerConfig {
        host: "0.0.0.0".to_string(),
        port: 5000,
        await_explicit_shutdown: config.await_explicit_shutdown,
        shutdown_grace_period: config.runner_shutdown_grace_period,
    };

    transport::serve(server_config, service).await
}

/// Spawn the single fixed-mode worker up front: fixed mode's worker slots
/// are created eagerly at startup, not lazily on first request.
async fn start_fixed(
    service: &Arc<PredictionService>,
    config: &Config,
    setup_log_rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let predictor_ref =
        std::env::var("PREDICTOR_REF").unwrap_or_else(|_| "predict:Predictor".to_string());

    let orchestrator_config = OrchestratorConfig::new(predictor_ref)
        .with_num_slots(config.concurrency_max.max(1))
        .with_output_uploader(OutputUploader::new(config.upload_url.clone()));

    let ready = orchestrator::spawn_worker(orchestrator_config, setup_log_rx)
        .await
        .context("worker setup failed")?;

    let setup_result = runloom::SetupResult::starting().succeeded(ready.setup_logs);
    service.set_setup_result(setup_result).await;
    if let Some(schema) = ready.schema {
        service.set_schema(schema).await;
    }

    service
        .set_orchestrator(ready.pool, Arc::new(ready.handle))
        .await;
    service.set_health(Health::Ready).await;

    Ok(())
}

/// Wire up dynamic/"procedure" mode: no worker is spawned at startup, only
/// the scheduler that will spawn one per first-seen `procedure_source_url`.
async fn start_dynamic(service: &Arc<PredictionService>, config: &Config) -> anyhow::Result<()> {
    let spawner = Arc::new(ProcessSpawner {
        concurrency_max: config.concurrency_max.max(1),
        upload_url: config.upload_url.clone(),
    });
    let scheduler = Arc::new(DynamicScheduler::new(
        config.max_runners,
        config.concurrency_max.max(1),
        spawner,
    ));
    service.set_dynamic_scheduler(scheduler).await;
    service.set_health(Health::Ready).await;
    Ok(())
}

/// Spawns a worker subprocess for a dynamic-mode slot binding. The
/// `source_url` becomes the worker's `predictor_ref` - in dynamic mode
/// that's the per-request procedure URL rather than a fixed module path.
struct ProcessSpawner {
    concurrency_max: usize,
    upload_url: Option<String>,
}

#[async_trait::async_trait]
impl DynamicWorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        source_url: &str,
    ) -> Result<(Arc<PermitPool>, Arc<dyn Orchestrator>), SchedulerError> {
        let orchestrator_config = OrchestratorConfig::new(source_url.to_string())
            .with_num_slots(self.concurrency_max)
            .with_output_uploader(OutputUploader::new(self.upload_url.clone()));

        let (_tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ready = orchestrator::spawn_worker(orchestrator_config, &mut rx)
            .await
            .map_err(|e| SchedulerError::SetupFailed(e.to_string()))?;

        let handle: Arc<dyn Orchestrator> = Arc::new(ready.handle);
        Ok((ready.pool, handle))
    }
}
