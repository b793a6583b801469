//! Dispatch loop: pulls deliveries from a [`JobSource`] and runs each one
//! as an independent task.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::processor::JobProcessor;
use crate::queue::JobSource;
use crate::telemetry::{self, ErrorSink};

/// Emit a heartbeat every this many dispatched jobs.
const HEARTBEAT_EVERY: u64 = 10;

pub struct Worker {
    processor: Arc<JobProcessor>,
    errors: Arc<dyn ErrorSink>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl Worker {
    pub fn new(processor: Arc<JobProcessor>, errors: Arc<dyn ErrorSink>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            processor,
            errors,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Runs until the source ends or `shutdown` fires, then waits for
    /// in-flight jobs. Returns the number of deliveries dispatched.
    ///
    /// At most `concurrency` jobs run at once; the loop keeps pulling while
    /// permits remain. A pull in progress is never abandoned: the source sees
    /// `shutdown` and ends its stream, and anything it yields first is still
    /// processed.
    pub async fn run(self, source: impl JobSource, shutdown: CancellationToken) -> u64 {
        let mut deliveries = source.deliveries(shutdown.clone());
        let mut dispatched: u64 = 0;

        info!(concurrency = self.concurrency, "Worker started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let incoming = match deliveries.next().await {
                Some(incoming) => incoming,
                None => {
                    info!("Job source exhausted");
                    break;
                }
            };

            let delivery = match incoming {
                Ok(delivery) => delivery,
                Err(malformed) => {
                    warn!(error = %malformed, bytes = malformed.raw.len(), "Dropping malformed queue message");
                    self.errors.capture(&malformed);
                    continue;
                }
            };

            let processor = Arc::clone(&self.processor);
            tokio::spawn(async move {
                let run = processor.process(delivery).await;
                telemetry::record_job_telemetry(&run);
                drop(permit);
            });

            dispatched += 1;
            if dispatched % HEARTBEAT_EVERY == 0 {
                let in_flight = self.concurrency - self.permits.available_permits();
                telemetry::record_worker_heartbeat(dispatched, in_flight);
            }
        }

        info!(dispatched, "Waiting for in-flight jobs to finish");
        // Every permit back means every spawned job has finished.
        let _ = self.permits.acquire_many(self.concurrency as u32).await;
        info!(dispatched, "Worker stopped");
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{MockDocumentGenerator, PageGeometry};
    use crate::notifier::MockNotifier;
    use crate::processor::ProcessorSettings;
    use crate::queue::{Delivery, Incoming};
    use crate::render::MockTemplateRenderer;
    use crate::storage::MockArtifactStore;
    use crate::telemetry::TelemetryErrorSink;
    use futures::stream::{self, BoxStream};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn processor(dir: &TempDir, notifier: MockNotifier) -> Arc<JobProcessor> {
        let mut renderer = MockTemplateRenderer::new();
        renderer
            .expect_render()
            .returning(|_, _| Ok("<p></p>".to_string()));
        let mut generator = MockDocumentGenerator::new();
        generator.expect_generate().returning(|_, _, path| {
            std::fs::write(path, b"%PDF").unwrap();
            Ok(())
        });
        let mut store = MockArtifactStore::new();
        store
            .expect_upload()
            .returning(|_, key| Ok(format!("https://files.example.com/{key}")));

        Arc::new(JobProcessor::new(
            Arc::new(renderer),
            Arc::new(generator),
            Arc::new(store),
            Arc::new(notifier),
            Arc::new(TelemetryErrorSink),
            ProcessorSettings {
                app_secret: "s".to_string(),
                scratch_dir: dir.path().to_path_buf(),
                time_zone: chrono_tz::UTC,
                page: PageGeometry::default(),
            },
        ))
    }

    fn delivery(n: u32) -> Incoming {
        Ok(Delivery::new(
            json!({
                "certificateId": n,
                "template": "t",
                "user": { "firstname": "A", "lastname": "B" },
                "run": { "start": 0, "end": 0 },
                "name": "Same"
            }),
            format!("http://cb/{n}"),
        ))
    }

    #[tokio::test]
    async fn test_dispatches_every_delivery_and_drains() {
        let dir = TempDir::new().unwrap();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(12).returning(|_, _| Ok(()));

        let mut items: Vec<Incoming> = (0..12).map(delivery).collect();
        items.insert(3, Delivery::from_message("garbage"));
        let source: BoxStream<'static, Incoming> = Box::pin(stream::iter(items));

        let worker = Worker::new(processor(&dir, notifier), Arc::new(TelemetryErrorSink), 3);
        let dispatched = worker.run(source, CancellationToken::new()).await;

        assert_eq!(dispatched, 12);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Yields one delivery after a delay and pays no attention to shutdown.
    struct SlowSource(Duration);

    impl JobSource for SlowSource {
        fn deliveries(self, _shutdown: CancellationToken) -> BoxStream<'static, Incoming> {
            let delay = self.0;
            Box::pin(stream::once(async move {
                tokio::time::sleep(delay).await;
                delivery(0)
            }))
        }
    }

    #[tokio::test]
    async fn test_delivery_pulled_during_shutdown_is_processed() {
        let dir = TempDir::new().unwrap();
        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(move |callback, report| {
            assert_eq!(callback, "http://cb/0");
            assert!(report.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let worker = Worker::new(processor(&dir, notifier), Arc::new(TelemetryErrorSink), 2);
        let dispatched = worker
            .run(SlowSource(Duration::from_millis(200)), shutdown)
            .await;

        assert_eq!(dispatched, 1);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let source: BoxStream<'static, Incoming> = Box::pin(stream::pending());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let worker = Worker::new(processor(&dir, notifier), Arc::new(TelemetryErrorSink), 2);
        assert_eq!(worker.run(source, shutdown).await, 0);
    }
}
