use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Verdict of a single probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub validator_id: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beacon_block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BlockHeadResponse {
    data: BlockHeadData,
}

#[derive(Debug, Deserialize)]
struct BlockHeadData {
    message: BlockHeadMessage,
}

#[derive(Debug, Deserialize)]
struct BlockHeadMessage {
    slot: String,
}

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Probes the beacon node's health endpoint with retry. A probe is unhealthy
/// only after every attempt has failed; the block-height lookup is decoration
/// and never downgrades a healthy verdict.
pub struct HealthChecker {
    client: reqwest::Client,
    beacon_node_url: String,
    validator_id: String,
    timeout: Duration,
    retries: u32,
}

impl HealthChecker {
    pub fn new(beacon_node_url: &str, validator_id: &str, timeout: Duration, retries: u32) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap(); // Should not fail with default settings
        Self {
            client,
            beacon_node_url: beacon_node_url.trim_end_matches('/').to_string(),
            validator_id: validator_id.to_string(),
            timeout,
            retries: retries.max(1),
        }
    }

    pub async fn probe(&self) -> HealthCheckResult {
        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=self.retries {
            match self.check_health().await {
                Ok(()) => {
                    let beacon_block_height = self.fetch_block_height().await;
                    return HealthCheckResult {
                        validator_id: self.validator_id.clone(),
                        status: HealthStatus::Healthy,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        timestamp: Utc::now(),
                        error: None,
                        beacon_block_height,
                    };
                }
                Err(e) => {
                    warn!(attempt, retries = self.retries, error = %e, "Health check attempt failed.");
                    last_error = e;
                    if attempt < self.retries {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        HealthCheckResult {
            validator_id: self.validator_id.clone(),
            status: HealthStatus::Unhealthy,
            response_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            error: Some(last_error),
            beacon_block_height: None,
        }
    }

    async fn check_health(&self) -> Result<(), String> {
        let url = format!("{}/eth/v1/node/health", self.beacon_node_url);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("Beacon node returned status {}", response.status())),
            Err(e) if e.is_timeout() => Err("Health check timed out".to_string()),
            Err(e) => Err(format!("Request failed: {e}")),
        }
    }

    async fn fetch_block_height(&self) -> Option<u64> {
        let url = format!("{}/eth/v1/beacon/blocks/head", self.beacon_node_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout / 2)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(status = %response.status(), "Block head lookup failed.");
            return None;
        }
        let head: BlockHeadResponse = response.json().await.ok()?;
        match head.data.message.slot.parse::<u64>() {
            Ok(slot) => Some(slot),
            Err(e) => {
                debug!(error = %e, "Block head slot is not an integer.");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_head_response_parses_beacon_payload() {
        let raw = r#"{"data":{"message":{"slot":"8123456"}}}"#;
        let head: BlockHeadResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(head.data.message.slot.parse::<u64>().unwrap(), 8_123_456);
    }

    #[test]
    fn health_status_uses_wire_casing() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            r#""UNHEALTHY""#
        );
        let parsed: HealthStatus = serde_json::from_str(r#""HEALTHY""#).unwrap();
        assert_eq!(parsed, HealthStatus::Healthy);
    }

    #[test]
    fn result_omits_empty_optionals_on_the_wire() {
        let result = HealthCheckResult {
            validator_id: "validator-1".to_string(),
            status: HealthStatus::Healthy,
            response_time_ms: 42,
            timestamp: Utc::now(),
            error: None,
            beacon_block_height: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("beaconBlockHeight").is_none());
        assert_eq!(json["validatorId"], "validator-1");
    }
}
