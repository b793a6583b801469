//! Certificate Issuance Worker Service
//!
//! Consumes certificate requests from a Redis list, renders each to PDF with
//! headless Chromium, uploads it to object storage and reports back to the
//! request's callback URL.
//!
//! ## Architecture
//!
//! - **Queue**: Redis list (`certificate:issue:queue`), envelope `{data, callback}`
//! - **Renderer**: Handlebars templates from `template_dir`
//! - **Generator**: headless Chromium `--print-to-pdf`
//! - **Storage**: S3/MinIO (or a local directory)
//! - **Telemetry**: tracing + OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! `worker.toml` and `WORKER_*` environment variables (see `config`), plus:
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use certificate_worker::{
    config::{LogFormat, StorageBackend, WorkerConfig},
    generator::{ChromiumPdfGenerator, PageGeometry},
    notifier::HttpNotifier,
    processor::{JobProcessor, ProcessorSettings},
    queue::{JobQueue, RedisJobSource},
    render::HandlebarsRenderer,
    storage::ObjectArtifactStore,
    telemetry::{self, ErrorSink, TelemetryErrorSink},
    worker::Worker,
};
use redis::Client;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::load().context("Failed to load configuration")?;

    telemetry::init_tracing(config.log_format == LogFormat::Json);

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(
        redis_url = %config.redis_url,
        queue = %config.queue_key,
        concurrency = config.concurrency,
        time_zone = %config.time_zone,
        "Starting certificate worker"
    );

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .with_context(|| format!("Failed to create scratch dir {}", config.scratch_dir.display()))?;

    let store = match &config.storage {
        StorageBackend::S3(s3) => {
            ObjectArtifactStore::s3(s3, config.storage_public_url.clone())
                .context("Failed to configure S3 artifact store")?
        }
        StorageBackend::Local(dir) => {
            ObjectArtifactStore::local(dir, config.storage_public_url.clone())
                .context("Failed to configure local artifact store")?
        }
    };
    let notifier = HttpNotifier::new(config.callback_method.clone(), config.notify_timeout)
        .context("Failed to build callback HTTP client")?;
    let errors: Arc<dyn ErrorSink> = Arc::new(TelemetryErrorSink);

    let processor = Arc::new(JobProcessor::new(
        Arc::new(HandlebarsRenderer::new(&config.template_dir, &config.asset_base_url)),
        Arc::new(ChromiumPdfGenerator::new(&config.chrome_bin, config.render_timeout)),
        Arc::new(store),
        Arc::new(notifier),
        Arc::clone(&errors),
        ProcessorSettings {
            app_secret: config.app_secret.clone(),
            scratch_dir: config.scratch_dir.clone(),
            time_zone: config.time_zone,
            page: PageGeometry::default(),
        },
    ));

    // Connect to Redis
    let client = Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let source = RedisJobSource::new(JobQueue::new(conn, config.queue_key.clone()));
    let shutdown = CancellationToken::new();
    let worker = Worker::new(processor, errors, config.concurrency);
    let handle = tokio::spawn(worker.run(source, shutdown.clone()));

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, waiting for in-flight jobs...");
    shutdown.cancel();
    let dispatched = handle.await.context("Worker task panicked")?;

    telemetry::shutdown_telemetry();
    info!(dispatched, "Worker service shutdown complete");
    Ok(())
}
