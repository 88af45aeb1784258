use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::enums::{AlertStatus, ReportStatus};

/// A monitored validator. Created and owned by the CRUD layer; the core only
/// reads it.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub beacon_node_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A probing agent pinned to one validator. All agents monitoring the same
/// validator share that validator's credential.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub validator_id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub id: Uuid,
    pub agent_id: String,
    pub validator_id: String,
    pub status: ReportStatus,
    pub message: Option<String>,
    pub consensus: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub validator_id: String,
    pub user_id: String,
    pub status: AlertStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}
