//! Human step queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{DbError, models::HumanStepRow};

const STEP_COLUMNS: &str = "id, task_id, seq, node_key, step_name, background_info, \
    instructions, ai_suggestion, status, final_content, reject_reason, resolved_by, \
    resolved_at, created_at";

pub async fn insert_step(conn: &mut PgConnection, step: &HumanStepRow) -> Result<(), DbError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO human_steps ({STEP_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#
    ))
    .bind(step.id)
    .bind(step.task_id)
    .bind(step.seq)
    .bind(&step.node_key)
    .bind(&step.step_name)
    .bind(&step.background_info)
    .bind(&step.instructions)
    .bind(&step.ai_suggestion)
    .bind(&step.status)
    .bind(&step.final_content)
    .bind(&step.reject_reason)
    .bind(&step.resolved_by)
    .bind(step.resolved_at)
    .bind(step.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get_step(conn: &mut PgConnection, id: Uuid) -> Result<HumanStepRow, DbError> {
    sqlx::query_as::<_, HumanStepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM human_steps WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::NotFound)
}

/// A task's human steps in flow declaration order.
pub async fn list_steps(
    conn: &mut PgConnection,
    task_id: Uuid,
) -> Result<Vec<HumanStepRow>, DbError> {
    let rows = sqlx::query_as::<_, HumanStepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM human_steps WHERE task_id = $1 ORDER BY seq"
    ))
    .bind(task_id)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

/// Move a step out of `pending`.
///
/// The `status = 'pending'` guard makes the write one-shot: it returns
/// `false` when the step had already been resolved.
pub async fn resolve_step(
    conn: &mut PgConnection,
    id: Uuid,
    status: &str,
    final_content: Option<&str>,
    reject_reason: Option<&str>,
    resolved_by: &str,
    resolved_at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE human_steps
        SET status = $2, final_content = $3, reject_reason = $4,
            resolved_by = $5, resolved_at = $6
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(final_content)
    .bind(reject_reason)
    .bind(resolved_by)
    .bind(resolved_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}
