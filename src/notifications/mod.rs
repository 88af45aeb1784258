pub mod webhook;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::models::Alert;

/// Push-side capability the aggregator needs: fan validator, alert, and
/// consensus-progress events out to whoever is listening. Implemented by the
/// event broadcaster; tests substitute a recorder.
pub trait StatusBroadcast: Send + Sync {
    fn send_validator_update(&self, validator_id: &str, status: &str, extra: Value);
    fn send_alert_notification(&self, alert: &Alert);
    fn send_consensus_update(&self, validator_id: &str, data: Value);
}

/// Outbound-webhook capability: deliver `(user, event, payload)` to every
/// matching sink. Failures are the implementation's problem; callers never
/// block on delivery outcomes.
#[async_trait]
pub trait WebhookDispatch: Send + Sync {
    async fn dispatch(&self, user_id: &str, event: &str, payload: Value);
}
