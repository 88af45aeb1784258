use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::{Agent, Validator};

/// Loads an agent together with the validator it is scoped to. Returns `None`
/// when the agent id is unknown.
pub async fn get_agent_with_validator(
    pool: &PgPool,
    agent_id: &str,
) -> Result<Option<(Agent, Validator)>, sqlx::Error> {
    let agent = sqlx::query_as::<_, Agent>(
        "SELECT id, validator_id, api_key, is_active, last_seen FROM agents WHERE id = $1",
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await?;

    let Some(agent) = agent else {
        return Ok(None);
    };

    let validator = sqlx::query_as::<_, Validator>(
        "SELECT id, user_id, name, beacon_node_url, api_key, is_active, created_at
         FROM validators WHERE id = $1",
    )
    .bind(&agent.validator_id)
    .fetch_one(pool)
    .await?;

    Ok(Some((agent, validator)))
}

/// Marks the agent as seen. Runs inside the same transaction that persists
/// the report so `last_seen` never gets ahead of an accepted report.
pub async fn touch_last_seen(
    tx: &mut Transaction<'_, Postgres>,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE agents SET last_seen = $1 WHERE id = $2 AND (last_seen IS NULL OR last_seen <= $1)")
        .bind(now)
        .bind(agent_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Active agents whose last report is older than the cutoff. Agents that have
/// never reported are skipped; they show up once their first report lands.
pub async fn agents_silent_since(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Agent>, sqlx::Error> {
    sqlx::query_as::<_, Agent>(
        "SELECT id, validator_id, api_key, is_active, last_seen
         FROM agents
         WHERE is_active = TRUE AND last_seen IS NOT NULL AND last_seen < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}
