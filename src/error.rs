//! Pipeline error taxonomy and the description sent in failure reports.

use serde::Serialize;
use thiserror::Error;

use crate::generator::GenerationError;
use crate::job::InputError;
use crate::notifier::NotificationError;
use crate::render::RenderError;
use crate::storage::UploadError;

/// First failure raised by a job's pipeline.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Input(_) => "input",
            JobError::Render(_) => "render",
            JobError::Generation(_) => "generation",
            JobError::Upload(_) => "upload",
            JobError::Notification(_) => "notification",
        }
    }

    pub fn describe(&self) -> ErrorDescription {
        ErrorDescription {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Stable `{kind, message}` shape of the `error` field in failure reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDescription {
    pub kind: &'static str,
    pub message: String,
}
