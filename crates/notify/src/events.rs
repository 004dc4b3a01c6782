//! Event payloads and the sink traits: the contract every collaborator fulfils.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SinkError;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A task was created from a flow.
    TaskStart,
    /// A task reached at least one human checkpoint.
    HumanStep,
    /// Someone urged the assignee of a task.
    Reminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStart => "task_start",
            Self::HumanStep => "human_step",
            Self::Reminder => "reminder",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub task_id: Uuid,
    /// Set for checkpoint notifications that point at one specific step.
    pub step_id: Option<Uuid>,
    /// Role or user the notification is addressed to.
    pub target: String,
    pub title: String,
    pub content: String,
}

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn now(actor: impl Into<String>, action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Delivery channel for notifications (chat bot, mail, outbox table, …).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), SinkError>;
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), SinkError>;
}
