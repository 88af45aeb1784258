use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::db::models::Alert;
use crate::notifications::StatusBroadcast;

/// Envelope pushed to every observer session: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out hub for observer sessions. Backed by a tokio broadcast channel:
/// no per-observer queueing, lagging receivers drop messages, and session
/// tasks that cannot write evict themselves.
pub struct EventBroadcaster {
    tx: broadcast::Sender<OutboundMessage>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, kind: &str, data: Value) {
        let message = OutboundMessage::new(kind, data);
        if self.tx.send(message).is_err() {
            debug!(kind, "No observer sessions connected. Dropping broadcast.");
        }
    }

    pub fn send_validator_update(&self, validator_id: &str, status: &str, extra: Value) {
        let mut data = json!({
            "validatorId": validator_id,
            "status": status,
        });
        if let (Some(data_map), Some(extra_map)) = (data.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                data_map.insert(key.clone(), value.clone());
            }
        }
        self.broadcast("validator_update", data);
    }

    pub fn send_alert_notification(&self, alert: &Alert) {
        match serde_json::to_value(alert) {
            Ok(data) => self.broadcast("alert", data),
            Err(e) => debug!(error = %e, "Failed to serialize alert for broadcast."),
        }
    }

    pub fn send_agent_update(&self, agent_id: &str, status: &str, extra: Value) {
        let mut data = json!({
            "agentId": agent_id,
            "status": status,
        });
        if let (Some(data_map), Some(extra_map)) = (data.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                data_map.insert(key.clone(), value.clone());
            }
        }
        self.broadcast("agent_update", data);
    }
}

impl StatusBroadcast for EventBroadcaster {
    fn send_validator_update(&self, validator_id: &str, status: &str, extra: Value) {
        EventBroadcaster::send_validator_update(self, validator_id, status, extra);
    }

    fn send_alert_notification(&self, alert: &Alert) {
        EventBroadcaster::send_alert_notification(self, alert);
    }

    fn send_consensus_update(&self, validator_id: &str, data: Value) {
        let mut payload = json!({ "validatorId": validator_id });
        if let (Some(payload_map), Some(data_map)) = (payload.as_object_mut(), data.as_object()) {
            for (key, value) in data_map {
                payload_map.insert(key.clone(), value.clone());
            }
        }
        self.broadcast("consensus_update", payload);
    }
}
