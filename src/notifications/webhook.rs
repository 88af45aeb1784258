use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{header, Client};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::WebhookDispatch;
use crate::db::models::WebhookConfig;
use crate::db::services::webhook_service;

type HmacSha256 = Hmac<Sha256>;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "Sentinel-Webhook/1.0";

/// Delivers signed event payloads to user-configured HTTP sinks. One POST per
/// matching config, all in flight concurrently; a failed delivery is logged
/// and never retried here.
pub struct WebhookDispatcher {
    client: Client,
    pool: PgPool,
}

impl WebhookDispatcher {
    pub fn new(pool: PgPool) -> Self {
        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap(); // Should not fail with default settings
        Self { client, pool }
    }

    /// Hex HMAC-SHA256 of the exact request body.
    pub fn sign(body: &str, secret: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn deliver(client: Client, config: WebhookConfig, body: String) {
        let mut request = client
            .post(&config.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, USER_AGENT);

        if let Some(secret) = &config.secret {
            request = request.header("X-Sentinel-Signature", Self::sign(&body, secret));
        }

        match request.body(body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(webhook_id = %config.id, url = %config.url, "Webhook delivered.");
            }
            Ok(response) => {
                warn!(
                    webhook_id = %config.id,
                    url = %config.url,
                    status = %response.status(),
                    "Webhook endpoint returned non-success status."
                );
            }
            Err(e) => {
                warn!(webhook_id = %config.id, url = %config.url, error = %e, "Webhook delivery failed.");
            }
        }
    }
}

#[async_trait]
impl WebhookDispatch for WebhookDispatcher {
    async fn dispatch(&self, user_id: &str, event: &str, payload: Value) {
        let configs =
            match webhook_service::active_configs_for_event(&self.pool, user_id, event).await {
                Ok(configs) => configs,
                Err(e) => {
                    error!(user_id, event, error = %e, "Failed to load webhook configs.");
                    return;
                }
            };

        if configs.is_empty() {
            debug!(user_id, event, "No webhook configs subscribe to this event.");
            return;
        }

        let envelope = json!({
            "event": event,
            "timestamp": Utc::now(),
            "data": payload,
        });
        let body = envelope.to_string();

        debug!(user_id, event, count = configs.len(), "Dispatching webhooks.");
        let deliveries = configs
            .into_iter()
            .map(|config| Self::deliver(self.client.clone(), config, body.clone()));
        futures_util::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_independent_hmac() {
        let body = r#"{"event":"webhook.test","data":{"ping":true}}"#;
        let secret = "whsec_0123456789abcdef";

        let signature = WebhookDispatcher::sign(body, secret);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(signature, expected);
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn signature_depends_on_body_and_secret() {
        let signature = WebhookDispatcher::sign("body-a", "secret");
        assert_ne!(signature, WebhookDispatcher::sign("body-b", "secret"));
        assert_ne!(signature, WebhookDispatcher::sign("body-a", "other"));
    }

    #[test]
    fn envelope_carries_event_timestamp_and_data() {
        let envelope = json!({
            "event": "validator.unhealthy",
            "timestamp": Utc::now(),
            "data": {"validatorId": "v-1"},
        });
        let parsed: Value = serde_json::from_str(&envelope.to_string()).unwrap();
        assert_eq!(parsed["event"], "validator.unhealthy");
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["data"]["validatorId"], "v-1");
    }
}
