use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ApiError;

/// Appends an audit entry. Call inside the same transaction as the change
/// it describes so the log never records something that rolled back.
pub async fn record(
    conn: &mut PgConnection,
    actor_user_id: Option<Uuid>,
    action: &str,
    entity_type: &str,
    entity_id: Option<String>,
    detail: JsonValue,
) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (actor_user_id, action, entity_type, entity_id, detail)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(actor_user_id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(detail)
    .execute(conn)
    .await
    .map_err(ApiError::db)?;

    tracing::debug!(action, entity_type, "audit entry recorded");
    Ok(())
}
