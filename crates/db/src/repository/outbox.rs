//! Notification and audit outbox tables.

use sqlx::PgConnection;

use crate::{
    DbError,
    models::{AuditRow, NotificationRow},
};

pub async fn insert_notification(
    conn: &mut PgConnection,
    row: &NotificationRow,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO notifications (id, kind, task_id, step_id, target, title, content, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(row.id)
    .bind(&row.kind)
    .bind(row.task_id)
    .bind(row.step_id)
    .bind(&row.target)
    .bind(&row.title)
    .bind(&row.content)
    .bind(row.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn insert_audit_entry(conn: &mut PgConnection, row: &AuditRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, actor, action, detail, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(row.id)
    .bind(&row.actor)
    .bind(&row.action)
    .bind(&row.detail)
    .bind(row.created_at)
    .execute(conn)
    .await?;

    Ok(())
}
