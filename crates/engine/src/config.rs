//! Tuning knobs for the task executor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::SkipPropagation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// How far a non-taken condition branch reaches.
    pub skip_propagation: SkipPropagation,
    /// Assignee used when a trigger names none.
    pub default_assignee: Option<String>,
    /// Due date offset applied when a trigger names none.
    pub default_due_hours: Option<i64>,
    /// Role addressed by human-step notifications whose node names no role,
    /// and by task-start notifications for unassigned tasks.
    pub notify_role: String,
    /// Upper bound on how long a notification or audit sink may hold up a call.
    pub sink_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            skip_propagation: SkipPropagation::Direct,
            default_assignee: None,
            default_due_hours: None,
            notify_role: "manager".into(),
            sink_timeout_ms: 2_000,
        }
    }
}

impl ExecutorConfig {
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    /// `default_due_hours` as an offset, or `None` when unset or too large
    /// to represent.
    pub fn due_offset(&self) -> Option<chrono::Duration> {
        self.default_due_hours.and_then(chrono::Duration::try_hours)
    }
}
