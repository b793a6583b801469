//! Certificate job model, input normalization and per-job lifecycle state.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ErrorDescription;

/// Display format for run boundaries ("Nov 2023").
const RUN_DATE_FORMAT: &str = "%b %Y";

/// Number of trailing UUID characters kept as the salt.
const SALT_LEN: usize = 4;

/// Payload errors detected while normalizing a job.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("job payload has a null certificateId")]
    MissingCertificateId,
    #[error("run.{field} is not a representable timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: i64 },
}

/// One certificate-issuance request, as rendered into the template context.
///
/// Fields the worker does not interpret are kept in `extra` so templates can
/// still reference them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateJob {
    pub certificate_id: Value,
    pub template: String,
    pub user: Recipient,
    pub run: RunWindow,
    pub name: String,
    #[serde(default)]
    pub salt: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub firstname: String,
    pub lastname: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Run window in epoch seconds, plus the derived display strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWindow {
    #[serde(deserialize_with = "epoch_seconds")]
    pub start: i64,
    #[serde(deserialize_with = "epoch_seconds")]
    pub end: i64,
    #[serde(default)]
    pub start_string: String,
    #[serde(default)]
    pub end_string: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CertificateJob {
    /// Parses a raw queue payload and applies the issuance normalizations:
    /// fresh salt, run display strings in `tz`, lower-cased recipient name.
    pub fn normalize(payload: Value, tz: Tz) -> Result<Self, InputError> {
        let mut job: CertificateJob = serde_json::from_value(payload)?;
        if job.certificate_id.is_null() {
            return Err(InputError::MissingCertificateId);
        }

        job.salt = generate_salt();
        job.run.start_string = format_run_date(job.run.start, tz)
            .ok_or(InputError::InvalidTimestamp {
                field: "start",
                value: job.run.start,
            })?;
        job.run.end_string = format_run_date(job.run.end, tz).ok_or(InputError::InvalidTimestamp {
            field: "end",
            value: job.run.end,
        })?;
        job.user.firstname = job.user.firstname.to_lowercase();
        job.user.lastname = job.user.lastname.to_lowercase();

        Ok(job)
    }

    /// Template context: the normalized job under the `data` key.
    pub fn render_context(&self) -> Value {
        serde_json::json!({ "data": self })
    }
}

/// Accepts epoch seconds as an integer, a float (floored) or a numeric
/// string.
fn epoch_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(secs), _) => Ok(secs),
            (None, Some(secs)) => floor_seconds(secs)
                .ok_or_else(|| de::Error::custom(format!("epoch seconds out of range: {n}"))),
            (None, None) => Err(de::Error::custom(format!("epoch seconds out of range: {n}"))),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(floor_seconds))
                .ok_or_else(|| de::Error::custom(format!("invalid epoch seconds: {s:?}")))
        }
        other => Err(de::Error::invalid_type(
            de::Unexpected::Other(&other.to_string()),
            &"epoch seconds as a number or numeric string",
        )),
    }
}

fn floor_seconds(secs: f64) -> Option<i64> {
    let floored = secs.floor();
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    if floored.is_finite() && floored >= i64::MIN as f64 && floored < i64::MAX as f64 {
        Some(floored as i64)
    } else {
        None
    }
}

/// Formats an epoch timestamp as "<Mon> <YYYY>" in the given zone.
pub fn format_run_date(epoch_seconds: i64, tz: Tz) -> Option<String> {
    let utc = DateTime::<Utc>::from_timestamp(epoch_seconds, 0)?;
    Some(utc.with_timezone(&tz).format(RUN_DATE_FORMAT).to_string())
}

fn generate_salt() -> String {
    let id = Uuid::new_v4().to_string();
    id[id.len() - SALT_LEN..].to_string()
}

/// Which report variant a job ended up sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Pipeline position of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    Normalizing,
    Rendering,
    Generating,
    Uploading,
    Notifying(Outcome),
    Cleaned,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Received => write!(f, "received"),
            JobState::Normalizing => write!(f, "normalizing"),
            JobState::Rendering => write!(f, "rendering"),
            JobState::Generating => write!(f, "generating"),
            JobState::Uploading => write!(f, "uploading"),
            JobState::Notifying(Outcome::Success) => write!(f, "notifying_success"),
            JobState::Notifying(Outcome::Failure) => write!(f, "notifying_failure"),
            JobState::Cleaned => write!(f, "cleaned"),
            JobState::Done => write!(f, "done"),
        }
    }
}

impl JobState {
    /// Whether `next` is a legal successor: one step forward, or a jump
    /// from any pre-notification stage straight to `Notifying(Failure)`.
    pub fn permits(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Received, Normalizing)
            | (Normalizing, Rendering)
            | (Rendering, Generating)
            | (Generating, Uploading)
            | (Uploading, Notifying(Outcome::Success))
            | (Notifying(_), Cleaned)
            | (Cleaned, Done) => true,
            (Received | Normalizing | Rendering | Generating | Uploading, Notifying(Outcome::Failure)) => {
                true
            }
            _ => false,
        }
    }
}

/// Lifecycle record of one processed delivery, used for logs and telemetry.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub run_id: Uuid,
    pub certificate_id: Option<Value>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure: Option<ErrorDescription>,
    pub notified: bool,
}

impl JobRun {
    pub fn received(certificate_id: Option<Value>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            certificate_id,
            state: JobState::Received,
            created_at: now,
            updated_at: now,
            failure: None,
            notified: false,
        }
    }

    pub fn advance(&mut self, next: JobState) {
        if !self.state.permits(next) {
            warn!(
                run_id = %self.run_id,
                from = %self.state,
                to = %next,
                "Unexpected job state transition"
            );
        }
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "Job state transition");
        self.state = next;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, failure: ErrorDescription) {
        self.failure = Some(failure);
        self.advance(JobState::Notifying(Outcome::Failure));
    }

    /// The outcome report never reached the caller. The job ends as a
    /// failure; an earlier stage failure, if any, stays the recorded cause.
    pub fn mark_undelivered(&mut self, failure: ErrorDescription) {
        self.notified = false;
        self.failure.get_or_insert(failure);
    }

    pub fn outcome(&self) -> Outcome {
        if self.failure.is_some() {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.state == JobState::Done {
            Some(self.updated_at.signed_duration_since(self.created_at).num_milliseconds())
        } else {
            None
        }
    }
}
