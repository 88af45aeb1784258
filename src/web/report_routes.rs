use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::db::enums::ReportStatus;
use crate::db::services::{agent_service, report_service};
use crate::web::error::AppError;
use crate::web::models::{ReportRequest, ReportResponse};
use crate::web::AppState;

struct ValidatedReport {
    agent_id: String,
    agent_api_key: String,
    validator_id: String,
    status: ReportStatus,
    message: Option<String>,
}

fn validate(payload: ReportRequest) -> Result<ValidatedReport, AppError> {
    let agent_id = payload
        .agent_id
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput("Missing required field: agentId".to_string()))?;
    let agent_api_key = payload
        .agent_api_key
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput("Missing required field: agentApiKey".to_string()))?;
    let validator_id = payload
        .validator_id
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput("Missing required field: validatorId".to_string()))?;
    let status_raw = payload
        .status
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput("Missing required field: status".to_string()))?;
    let status = ReportStatus::parse(&status_raw)
        .ok_or_else(|| AppError::InvalidInput(format!("Invalid status: {status_raw}")))?;

    Ok(ValidatedReport {
        agent_id,
        agent_api_key,
        validator_id,
        status,
        message: payload.message,
    })
}

fn api_keys_match(submitted: &str, expected: &str) -> bool {
    submitted.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub async fn submit_report(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, AppError> {
    let report = validate(payload)?;

    let (agent, validator) =
        agent_service::get_agent_with_validator(&state.pool, &report.agent_id)
            .await?
            .ok_or_else(|| {
                warn!(agent_id = %report.agent_id, "Report from unknown agent.");
                AppError::Unauthorized("Unknown agent".to_string())
            })?;

    if !agent.is_active {
        return Err(AppError::Unauthorized("Agent is inactive".to_string()));
    }
    if !api_keys_match(&report.agent_api_key, &agent.api_key) {
        warn!(agent_id = %agent.id, "Report with invalid API key.");
        return Err(AppError::Unauthorized("Invalid API key".to_string()));
    }
    if agent.validator_id != report.validator_id {
        warn!(
            agent_id = %agent.id,
            claimed_validator = %report.validator_id,
            "Report for a validator outside the agent's scope."
        );
        return Err(AppError::Forbidden(
            "Agent is not scoped to this validator".to_string(),
        ));
    }
    if !validator.is_active {
        return Err(AppError::Forbidden("Validator is inactive".to_string()));
    }

    let now = Utc::now();
    let mut tx = state.pool.begin().await?;
    let stored = report_service::insert_report(
        &mut tx,
        &agent.id,
        &validator.id,
        report.status,
        report.message.as_deref(),
    )
    .await?;
    agent_service::touch_last_seen(&mut tx, &agent.id, now).await?;
    tx.commit().await?;

    info!(
        report_id = %stored.id,
        agent_id = %agent.id,
        validator_id = %validator.id,
        status = report.status.as_str(),
        "Report accepted."
    );

    state.liveness.report_seen(&agent.id, now).await;

    // Hand off to the aggregator before answering so the caller's reportId
    // reflects any consensus transition this report caused.
    state
        .aggregator
        .process_report(&stored, &validator)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

    Ok(Json(ReportResponse {
        success: true,
        report_id: stored.id,
    }))
}
