//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Statuses are stored as plain text; domain types live in the `engine`
//! crate, which converts in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// flows / flow_versions
// ---------------------------------------------------------------------------

/// The live head of a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowRow {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    /// Serialised trigger metadata (`{"type": "manual"}`, `{"type": "cron", …}`).
    pub trigger: serde_json::Value,
    pub nodes: serde_json::Value,
    pub edges: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable snapshot in a flow's history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowVersionRow {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub version: i32,
    pub trigger: serde_json::Value,
    pub nodes: serde_json::Value,
    pub edges: serde_json::Value,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Serialised content shared by a flow head and its snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowContent {
    pub trigger: serde_json::Value,
    pub nodes: serde_json::Value,
    pub edges: serde_json::Value,
}

// ---------------------------------------------------------------------------
// task_instances
// ---------------------------------------------------------------------------

/// A task instance row, joined with the number of pending human steps it owns.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub title: String,
    pub flow_name: String,
    pub status: String,
    pub current_step: Option<String>,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Computed by a sub-select, not a column.
    pub pending_steps: i64,
}

/// Columns written when a task row is created.
#[derive(Debug, Clone)]
pub struct NewTaskRow {
    pub id: Uuid,
    pub title: String,
    pub flow_name: String,
    pub status: String,
    pub current_step: Option<String>,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// dag_execution_nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DagNodeRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub seq: i32,
    pub node_key: String,
    pub label: String,
    pub node_type: String,
    pub status: String,
    pub source_keys: Vec<String>,
    pub log: Option<String>,
    pub error: Option<String>,
    pub position: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// human_steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HumanStepRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub seq: i32,
    pub node_key: String,
    pub step_name: String,
    pub background_info: Option<String>,
    pub instructions: Option<String>,
    pub ai_suggestion: Option<String>,
    pub status: String,
    pub final_content: Option<String>,
    pub reject_reason: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// notifications / audit_log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationRow {
    pub id: Uuid,
    pub kind: String,
    pub task_id: Uuid,
    pub step_id: Option<Uuid>,
    pub target: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditRow {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}
