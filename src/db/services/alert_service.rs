use sqlx::PgPool;

use crate::db::models::Alert;

/// Creates a PENDING alert for a quorum event. The aggregator's latch
/// guarantees this is called at most once per consensus window.
pub async fn create_alert(
    pool: &PgPool,
    validator_id: &str,
    user_id: &str,
    message: &str,
) -> Result<Alert, sqlx::Error> {
    sqlx::query_as::<_, Alert>(
        "INSERT INTO alerts (validator_id, user_id, status, message)
         VALUES ($1, $2, 'PENDING', $3)
         RETURNING id, validator_id, user_id, status, message, created_at, resolved_at",
    )
    .bind(validator_id)
    .bind(user_id)
    .bind(message)
    .fetch_one(pool)
    .await
}
