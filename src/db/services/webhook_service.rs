use sqlx::PgPool;

use crate::db::models::WebhookConfig;

/// Active webhook configurations of a user that subscribe to the given event.
pub async fn active_configs_for_event(
    pool: &PgPool,
    user_id: &str,
    event: &str,
) -> Result<Vec<WebhookConfig>, sqlx::Error> {
    sqlx::query_as::<_, WebhookConfig>(
        "SELECT id, user_id, url, secret, events, is_active, created_at
         FROM webhook_configs
         WHERE user_id = $1 AND is_active = TRUE AND $2 = ANY(events)",
    )
    .bind(user_id)
    .bind(event)
    .fetch_all(pool)
    .await
}
