//! Outcome reports and their delivery to the requester's callback URL.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorDescription;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid callback address {address:?}: {source}")]
    InvalidCallback {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("callback request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("callback rejected the report with status {status}")]
    Rejected { status: u16 },
}

/// The single report sent for every job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutcomeReport {
    #[serde(rename_all = "camelCase")]
    Success {
        secret: String,
        certificate_id: Value,
        url: String,
        salt: String,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        certificate_id: Option<Value>,
        secret: String,
        error: ErrorDescription,
    },
}

impl OutcomeReport {
    pub fn certificate_id(&self) -> Option<&Value> {
        match self {
            OutcomeReport::Success { certificate_id, .. } => Some(certificate_id),
            OutcomeReport::Failure { certificate_id, .. } => certificate_id.as_ref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeReport::Success { .. })
    }
}

/// Delivers an outcome report. One attempt, no retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, callback: &str, report: &OutcomeReport) -> Result<(), NotificationError>;
}

/// Sends reports as a JSON request body.
pub struct HttpNotifier {
    client: Client,
    method: Method,
}

impl HttpNotifier {
    pub fn new(method: Method, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .user_agent(concat!("certificate-worker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, method })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, callback: &str, report: &OutcomeReport) -> Result<(), NotificationError> {
        let url = url::Url::parse(callback).map_err(|source| NotificationError::InvalidCallback {
            address: callback.to_string(),
            source,
        })?;

        let response = self
            .client
            .request(self.method.clone(), url)
            .json(report)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(callback, status = status.as_u16(), "Outcome report delivered");
        Ok(())
    }
}
