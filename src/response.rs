use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{error, info};

use crate::config::CALLBACK_RESERVE_SECONDS;
use crate::event::CorrelationIds;
use crate::reconciler::{ReconciliationOutcome, Status};

/// CloudFormation rejects response bodies above 4096 bytes.
const MAX_REASON_BYTES: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Callback rejected with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackBody {
    pub status: Status,
    pub reason: String,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    pub data: BTreeMap<String, String>,
}

impl CallbackBody {
    pub fn new(
        outcome: &ReconciliationOutcome,
        correlation_ids: &CorrelationIds,
        physical_resource_id: String,
        log_stream: Option<&str>,
    ) -> Self {
        let reason = match log_stream {
            Some(stream) => format!(
                "See the details in CloudWatch Log Stream: {}. {}",
                stream, outcome.reason
            ),
            None => outcome.reason.clone(),
        };

        Self {
            status: outcome.status,
            reason: truncate(reason, MAX_REASON_BYTES),
            physical_resource_id,
            stack_id: correlation_ids.stack_id.clone(),
            request_id: correlation_ids.request_id.clone(),
            logical_resource_id: correlation_ids.logical_resource_id.clone(),
            data: outcome.report.data(),
        }
    }
}

fn truncate(mut reason: String, max_bytes: usize) -> String {
    if reason.len() <= max_bytes {
        return reason;
    }

    let mut end = max_bytes.saturating_sub(3);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.truncate(end);
    reason.push_str("...");

    return reason;
}

pub struct CallbackClient {
    http: reqwest::Client,
}

impl CallbackClient {
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALLBACK_RESERVE_SECONDS))
            .build()?;

        Ok(Self { http })
    }

    /// Sends the body to the presigned URL. Failures are logged and reported
    /// through the return value only; the invocation carries on either way.
    pub async fn deliver(&self, url: &str, body: &CallbackBody) -> bool {
        match self.put(url, body).await {
            Ok(status) => {
                info!(status_code = status, "Callback delivered");
                true
            }
            Err(err) => {
                error!(error = %err, "Send response error");
                false
            }
        }
    }

    async fn put(&self, url: &str, body: &CallbackBody) -> Result<u16, Error> {
        let payload = serde_json::to_string(body)?;
        info!(body = %payload, "Response body");

        // The presigned URL is signed for an empty content type.
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rejected(status.as_u16()));
        }

        Ok(status.as_u16())
    }
}
