use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::enums::ReportStatus;
use crate::db::models::AgentReport;

pub async fn insert_report(
    tx: &mut Transaction<'_, Postgres>,
    agent_id: &str,
    validator_id: &str,
    status: ReportStatus,
    message: Option<&str>,
) -> Result<AgentReport, sqlx::Error> {
    sqlx::query_as::<_, AgentReport>(
        "INSERT INTO agent_reports (agent_id, validator_id, status, message)
         VALUES ($1, $2, $3, $4)
         RETURNING id, agent_id, validator_id, status, message, consensus, created_at",
    )
    .bind(agent_id)
    .bind(validator_id)
    .bind(status)
    .bind(message)
    .fetch_one(&mut **tx)
    .await
}

/// Rewrites a set of reports to a terminal consensus status.
pub async fn mark_reports(
    pool: &PgPool,
    report_ids: &[Uuid],
    status: ReportStatus,
    consensus: bool,
) -> Result<u64, sqlx::Error> {
    if report_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("UPDATE agent_reports SET status = $1, consensus = $2 WHERE id = ANY($3)")
        .bind(status)
        .bind(consensus)
        .bind(report_ids)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
