//! Durable sinks backed by the `notifications` and `audit_log` tables.
//!
//! Rows written here form an outbox; delivering them to a chat bot or
//! mailer is the job of whatever drains the table.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use db::models::{AuditRow, NotificationRow};
use db::repository::outbox;
use db::DbPool;

use crate::{AuditEntry, AuditSink, Notification, NotificationSink, SinkError};

/// Writes notifications and audit entries to Postgres.
#[derive(Clone)]
pub struct PgSink {
    pool: DbPool,
}

impl PgSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgSink {
    async fn send(&self, notification: Notification) -> Result<(), SinkError> {
        let row = NotificationRow {
            id: Uuid::new_v4(),
            kind: notification.kind.as_str().to_owned(),
            task_id: notification.task_id,
            step_id: notification.step_id,
            target: notification.target,
            title: notification.title,
            content: notification.content,
            created_at: Utc::now(),
        };
        let mut conn = self.pool.acquire().await.map_err(db::DbError::from)?;
        outbox::insert_notification(&mut *conn, &row).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), SinkError> {
        let row = AuditRow {
            id: Uuid::new_v4(),
            actor: entry.actor,
            action: entry.action,
            detail: entry.detail,
            created_at: entry.timestamp,
        };
        let mut conn = self.pool.acquire().await.map_err(db::DbError::from)?;
        outbox::insert_audit_entry(&mut *conn, &row).await?;
        Ok(())
    }
}
