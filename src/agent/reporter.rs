use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::agent::config::AgentConfig;
use crate::agent::probe::HealthStatus;

#[derive(Debug, Error)]
enum SubmitError {
    /// 4xx from the collector. Retrying cannot help.
    #[error("collector rejected report ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("collector returned {0}")]
    ServerError(reqwest::StatusCode),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportPayload<'a> {
    agent_id: &'a str,
    agent_api_key: &'a str,
    validator_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportAck {
    report_id: Option<String>,
}

/// Submits status transitions to the collector with retry and exponential
/// backoff. Tracks the last status the collector actually accepted so steady
/// healthy cycles stay silent.
pub struct Reporter {
    client: reqwest::Client,
    endpoint: String,
    agent_id: String,
    agent_api_key: String,
    validator_id: String,
    max_retries: u32,
    last_reported: Mutex<Option<HealthStatus>>,
}

impl Reporter {
    pub fn new(config: &AgentConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap(); // Should not fail with default settings
        Self {
            client,
            endpoint: format!(
                "{}/api/report",
                config.backend_api_url.trim_end_matches('/')
            ),
            agent_id: config.agent_id.clone(),
            agent_api_key: config.agent_api_key.clone(),
            validator_id: config.validator_id.clone(),
            max_retries: config.max_retries.max(1),
            last_reported: Mutex::new(None),
        }
    }

    /// True until a HEALTHY report has been accepted; a healthy cycle after
    /// that is suppressed until the status flips again.
    pub async fn should_report_healthy(&self) -> bool {
        *self.last_reported.lock().await != Some(HealthStatus::Healthy)
    }

    /// Sends one report, retrying transient failures with 1s/2s/4s... backoff.
    /// Returns whether the collector accepted it. On final failure nothing is
    /// recorded, so the next cycle re-evaluates from scratch.
    pub async fn submit_status(&self, status: HealthStatus, message: Option<String>) -> bool {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_submit(status, message.as_deref()).await {
                Ok(report_id) => {
                    info!(
                        status = status.as_str(),
                        report_id = report_id.as_deref().unwrap_or("unknown"),
                        "Report accepted by collector."
                    );
                    *self.last_reported.lock().await = Some(status);
                    return true;
                }
                Err(SubmitError::Rejected { status, body }) => {
                    error!(http_status = %status, body = %body, "Collector rejected report. Not retrying.");
                    return false;
                }
                Err(e) => {
                    warn!(attempt, max_retries = self.max_retries, error = %e, "Report submission failed.");
                    if attempt >= self.max_retries {
                        error!("Giving up on report for this cycle.");
                        return false;
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    debug!(backoff_secs = backoff.as_secs(), "Backing off before retry.");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn try_submit(
        &self,
        status: HealthStatus,
        message: Option<&str>,
    ) -> Result<Option<String>, SubmitError> {
        let payload = ReportPayload {
            agent_id: &self.agent_id,
            agent_api_key: &self.agent_api_key,
            validator_id: &self.validator_id,
            status: status.as_str(),
            message,
        };
        let response = self.client.post(&self.endpoint).json(&payload).send().await?;
        let http_status = response.status();
        if http_status.is_success() {
            let ack: ReportAck = response.json().await.unwrap_or(ReportAck { report_id: None });
            return Ok(ack.report_id);
        }
        if http_status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status: http_status,
                body,
            });
        }
        Err(SubmitError::ServerError(http_status))
    }

    #[cfg(test)]
    async fn set_last_reported(&self, status: Option<HealthStatus>) {
        *self.last_reported.lock().await = status;
    }
}
