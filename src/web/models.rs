use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/report`. All fields optional at the serde layer so the
/// handler can answer missing fields with 400 instead of a deserialize error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub agent_id: Option<String>,
    pub agent_api_key: Option<String>,
    pub validator_id: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub success: bool,
    pub report_id: Uuid,
}
