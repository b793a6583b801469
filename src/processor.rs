//! The per-delivery certificate pipeline.
//!
//! normalize → render → generate → upload → notify, with exactly one
//! outcome report per delivery and the scratch PDF removed on every path.

use chrono_tz::Tz;
use serde_json::Value;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use crate::error::JobError;
use crate::generator::{DocumentGenerator, GenerationError, PageGeometry};
use crate::job::{CertificateJob, JobRun, JobState, Outcome};
use crate::notifier::{Notifier, OutcomeReport};
use crate::queue::Delivery;
use crate::render::TemplateRenderer;
use crate::storage::{destination_key, ArtifactStore};
use crate::telemetry::ErrorSink;

/// Scratch location for one job's PDF.
///
/// The file is removed by [`ScratchFile::close`], or when the guard is
/// dropped if the job is abandoned mid-flight.
pub struct ScratchFile {
    path: TempPath,
}

impl ScratchFile {
    /// Reserves `<dir>/<uuid>.pdf` as an absolute path. Nothing is created
    /// on disk.
    pub fn allocate(dir: &Path) -> io::Result<Self> {
        let path = dir.join(format!("{}.pdf", Uuid::new_v4()));
        Ok(Self {
            path: TempPath::try_from_path(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file. A file that was never written is not an error.
    pub fn close(self) -> io::Result<()> {
        let path = self.path.to_path_buf();
        match self.path.close() {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
            Ok(()) => {
                debug!(path = %path.display(), "Scratch file removed");
                Ok(())
            }
        }
    }
}

/// Fixed parameters shared by every job.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub app_secret: String,
    pub scratch_dir: PathBuf,
    pub time_zone: Tz,
    pub page: PageGeometry,
}

/// What the success path produced, ready to report.
struct Issued {
    certificate_id: Value,
    url: String,
    salt: String,
}

/// Drives one delivery through the pipeline.
pub struct JobProcessor {
    renderer: Arc<dyn TemplateRenderer>,
    generator: Arc<dyn DocumentGenerator>,
    store: Arc<dyn ArtifactStore>,
    notifier: Arc<dyn Notifier>,
    errors: Arc<dyn ErrorSink>,
    settings: ProcessorSettings,
}

impl JobProcessor {
    pub fn new(
        renderer: Arc<dyn TemplateRenderer>,
        generator: Arc<dyn DocumentGenerator>,
        store: Arc<dyn ArtifactStore>,
        notifier: Arc<dyn Notifier>,
        errors: Arc<dyn ErrorSink>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            renderer,
            generator,
            store,
            notifier,
            errors,
            settings,
        }
    }

    /// Processes one delivery to completion.
    ///
    /// Never fails: every error becomes a failure report and an error-sink
    /// capture. The returned record is for logging and telemetry only.
    pub async fn process(&self, delivery: Delivery) -> JobRun {
        let certificate_id = delivery.payload.get("certificateId").cloned();
        let mut run = JobRun::received(certificate_id.clone());
        let span = tracing::info_span!(
            "certificate_job",
            run_id = %run.run_id,
            certificate_id = %certificate_id.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        );

        self.execute(delivery, certificate_id, &mut run)
            .instrument(span)
            .await;
        run
    }

    async fn execute(&self, delivery: Delivery, certificate_id: Option<Value>, run: &mut JobRun) {
        let Delivery { payload, callback } = delivery;
        let (scratch, issued) = match ScratchFile::allocate(&self.settings.scratch_dir) {
            Ok(scratch) => {
                let issued = self.issue(payload, &scratch, run).await;
                (Some(scratch), issued)
            }
            Err(err) => (None, Err(GenerationError::Io(err).into())),
        };

        let report = match issued {
            Ok(issued) => {
                run.advance(JobState::Notifying(Outcome::Success));
                OutcomeReport::Success {
                    secret: self.settings.app_secret.clone(),
                    certificate_id: issued.certificate_id,
                    url: issued.url,
                    salt: issued.salt,
                }
            }
            Err(err) => {
                error!(stage = %run.state, kind = err.kind(), error = %err, "Certificate job failed");
                self.errors.capture(&err);
                let description = err.describe();
                run.mark_failed(description.clone());
                OutcomeReport::Failure {
                    certificate_id: certificate_id.filter(|id| !id.is_null()),
                    secret: self.settings.app_secret.clone(),
                    error: description,
                }
            }
        };

        match self.notifier.notify(&callback, &report).await {
            Ok(()) => {
                run.notified = true;
                info!(success = report.is_success(), "Outcome reported");
            }
            Err(err) => {
                let err = JobError::from(err);
                error!(callback = %callback, error = %err, "Failed to deliver outcome report");
                self.errors.capture(&err);
                run.mark_undelivered(err.describe());
            }
        }

        if let Some(Err(err)) = scratch.map(ScratchFile::close) {
            error!(error = %err, "Failed to remove scratch file");
            self.errors.capture(&err);
        }
        run.advance(JobState::Cleaned);
        run.advance(JobState::Done);
    }

    /// The success path. Returns at the first failing stage.
    async fn issue(
        &self,
        payload: Value,
        scratch: &ScratchFile,
        run: &mut JobRun,
    ) -> Result<Issued, JobError> {
        run.advance(JobState::Normalizing);
        let job = CertificateJob::normalize(payload, self.settings.time_zone)?;

        run.advance(JobState::Rendering);
        let html = self
            .renderer
            .render(&job.template, &job.render_context())
            .await?;

        run.advance(JobState::Generating);
        self.generator
            .generate(&html, &self.settings.page, scratch.path())
            .await?;

        run.advance(JobState::Uploading);
        let key = destination_key(&job.name);
        let url = self.store.upload(scratch.path(), &key).await?;

        Ok(Issued {
            certificate_id: job.certificate_id,
            url,
            salt: job.salt,
        })
    }
}
