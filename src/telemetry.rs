//! Telemetry, structured logging and the process-wide error sink.

use crate::job::{JobRun, Outcome};
use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::{global, KeyValue};
use std::error::Error;
use std::fmt::Write as _;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TRACER_NAME: &str = "certificate-worker";

/// Jobs slower than this get a warning.
const SLOW_JOB_THRESHOLD_MS: i64 = 10_000;

/// Receives every error worth an operator's attention. Fire-and-forget.
pub trait ErrorSink: Send + Sync {
    fn capture(&self, error: &(dyn Error + 'static));
}

/// Logs the full error chain and records an OpenTelemetry error span.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryErrorSink;

impl ErrorSink for TelemetryErrorSink {
    fn capture(&self, err: &(dyn Error + 'static)) {
        let chain = error_chain(err);
        error!(error = %chain, "Captured error");

        let tracer = global::tracer(TRACER_NAME);
        let mut span = tracer.start("job_error");
        span.record_error(err);
        span.set_status(Status::error(chain));
        span.end();
    }
}

/// `outer: inner: root` rendering of an error and its sources.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(out, ": {cause}");
        source = cause.source();
    }
    out
}

/// Records telemetry for a finished job.
///
/// Emits a `certificate_job` span and a structured log line with the
/// outcome, duration and failure kind.
pub fn record_job_telemetry(run: &JobRun) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("certificate_job");

    let certificate_id = run
        .certificate_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();
    let outcome = match run.outcome() {
        Outcome::Success => "success",
        Outcome::Failure => "failure",
    };

    span.set_attribute(KeyValue::new("run_id", run.run_id.to_string()));
    span.set_attribute(KeyValue::new("certificate_id", certificate_id.clone()));
    span.set_attribute(KeyValue::new("state", run.state.to_string()));
    span.set_attribute(KeyValue::new("outcome", outcome));
    span.set_attribute(KeyValue::new("notified", run.notified));

    if let Some(duration_ms) = run.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            run_id = %run.run_id,
            certificate_id = %certificate_id,
            duration_ms,
            outcome,
            notified = run.notified,
            "Certificate job finished"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                run_id = %run.run_id,
                duration_ms,
                "Certificate job exceeded performance threshold ({}ms)",
                SLOW_JOB_THRESHOLD_MS
            );
        }
    }

    if let Some(ref failure) = run.failure {
        span.set_attribute(KeyValue::new("error.kind", failure.kind));
        span.set_attribute(KeyValue::new("error.message", failure.message.clone()));
        span.set_status(Status::error(failure.message.clone()));
        warn!(
            run_id = %run.run_id,
            certificate_id = %certificate_id,
            kind = failure.kind,
            error = %failure.message,
            "Certificate job failed"
        );
    }

    span.end();
}

/// Records a worker heartbeat with the number of jobs in flight.
pub fn record_worker_heartbeat(dispatched: u64, in_flight: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("dispatched", dispatched as i64));
    span.set_attribute(KeyValue::new("in_flight", in_flight as i64));
    span.end();

    info!(dispatched, in_flight, "Worker heartbeat");
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` controls filtering (default `info`); `json` switches the
/// output to one JSON object per line.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Initializes OpenTelemetry with OTLP exporter.
///
/// This should be called once at worker startup, from within the tokio
/// runtime. Reads configuration from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: certificate-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

/// Flushes pending spans on shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDescription;
    use crate::job::JobState;
    use serde_json::json;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("upload failed")]
    struct Outer(#[source] Inner);

    #[derive(Debug, Error)]
    #[error("connection reset")]
    struct Inner;

    #[test]
    fn test_error_chain() {
        assert_eq!(error_chain(&Outer(Inner)), "upload failed: connection reset");
    }

    #[test]
    fn test_sink_capture_without_provider() {
        // No provider installed: global tracer is a no-op, capture must not panic.
        TelemetryErrorSink.capture(&Outer(Inner));
    }

    #[test]
    fn test_record_job_telemetry() {
        let mut run = JobRun::received(Some(json!("cert-1")));
        for state in [
            JobState::Normalizing,
            JobState::Rendering,
            JobState::Generating,
            JobState::Uploading,
            JobState::Notifying(Outcome::Success),
            JobState::Cleaned,
            JobState::Done,
        ] {
            run.advance(state);
        }
        run.notified = true;

        // Should not panic
        record_job_telemetry(&run);
    }

    #[test]
    fn test_record_failed_job() {
        let mut run = JobRun::received(None);
        run.mark_failed(ErrorDescription {
            kind: "input",
            message: "malformed job payload".to_string(),
        });
        run.advance(JobState::Cleaned);
        run.advance(JobState::Done);

        record_job_telemetry(&run);
        record_worker_heartbeat(10, 2);
    }
}
