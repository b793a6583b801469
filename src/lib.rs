//! Certificate Issuance Worker Library
//!
//! Consumes certificate requests from a queue, renders each one to PDF,
//! uploads the PDF and reports the outcome to the requester's callback.
//!
//! ## Module Overview
//!
//! - `config`: layered configuration (`worker.toml`, `WORKER_*` env vars)
//! - `error`: pipeline error taxonomy and failure descriptions
//! - `generator`: HTML to PDF through headless Chromium
//! - `job`: certificate job model, normalization and lifecycle state
//! - `notifier`: outcome reports and HTTP callback delivery
//! - `processor`: the per-delivery pipeline
//! - `queue`: job source abstraction and the Redis list queue
//! - `render`: Handlebars template rendering
//! - `storage`: artifact upload to S3-compatible storage
//! - `telemetry`: tracing, OpenTelemetry and the error sink
//! - `worker`: concurrent dispatch loop
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use certificate_worker::{
//!     generator::{ChromiumPdfGenerator, PageGeometry},
//!     notifier::HttpNotifier,
//!     processor::{JobProcessor, ProcessorSettings},
//!     queue::Delivery,
//!     render::HandlebarsRenderer,
//!     storage::ObjectArtifactStore,
//!     telemetry::TelemetryErrorSink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let assets = url::Url::parse("http://localhost:8000/")?;
//!     let public = url::Url::parse("https://files.example.com/certificates/")?;
//!
//!     let processor = JobProcessor::new(
//!         Arc::new(HandlebarsRenderer::new("./templates", &assets)),
//!         Arc::new(ChromiumPdfGenerator::new("chromium", Duration::from_secs(60))),
//!         Arc::new(ObjectArtifactStore::local("./artifacts", public)?),
//!         Arc::new(HttpNotifier::new(reqwest::Method::PATCH, Duration::from_secs(30))?),
//!         Arc::new(TelemetryErrorSink),
//!         ProcessorSettings {
//!             app_secret: "change-me".to_string(),
//!             scratch_dir: "./certification".into(),
//!             time_zone: chrono_tz::Asia::Kolkata,
//!             page: PageGeometry::default(),
//!         },
//!     );
//!
//!     let payload = serde_json::json!({
//!         "certificateId": "cert-1",
//!         "template": "participation",
//!         "user": { "firstname": "Ada", "lastname": "Lovelace" },
//!         "run": { "start": 1700000000, "end": 1709251200 },
//!         "name": "Analytical Engines"
//!     });
//!     processor
//!         .process(Delivery::new(payload, "https://api.example.com/certificates/cert-1"))
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod generator;
mod html;
pub mod job;
pub mod notifier;
pub mod processor;
pub mod queue;
pub mod render;
pub mod storage;
pub mod telemetry;
pub mod worker;
