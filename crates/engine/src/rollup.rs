//! Task status roll-up: the one place that decides a task's aggregate
//! status from its human steps.
//!
//! Every function here is pure. Store implementations call them while they
//! hold the task's lock and write back whatever they return, so the same
//! rules apply whether tasks live in memory or in Postgres.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{HumanStep, StepStatus, TaskInstance, TaskStatus};
use crate::EngineError;

pub const COMPLETED_LABEL: &str = "已完成";

/// Fields of a task owned by the roll-up rules.
#[derive(Debug, Clone, PartialEq)]
pub struct RollUp {
    pub status: TaskStatus,
    pub current_step: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The transition moved the task from a live status into a terminal one.
    pub finalized: bool,
}

/// How a pending human step is being closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepResolution {
    Submit { content: String, actor: String },
    Reject { reason: String, actor: String },
}

impl StepResolution {
    pub fn actor(&self) -> &str {
        match self {
            Self::Submit { actor, .. } | Self::Reject { actor, .. } => actor,
        }
    }
}

/// `has_human_step` as exposed on reads: the task is still live and at
/// least one of its steps is pending.
pub fn has_human_step(status: TaskStatus, pending_steps: usize) -> bool {
    !status.is_terminal() && pending_steps > 0
}

/// Status of a freshly instantiated task given its pending step names in
/// declaration order.
pub fn after_instantiation(pending_steps: &[String], now: DateTime<Utc>) -> RollUp {
    match pending_steps.first() {
        Some(first) => RollUp {
            status: TaskStatus::Running,
            current_step: Some(first.clone()),
            completed_at: None,
            finalized: false,
        },
        None => RollUp {
            status: TaskStatus::Completed,
            current_step: Some(COMPLETED_LABEL.into()),
            completed_at: Some(now),
            finalized: true,
        },
    }
}

/// Close `step` and compute the owning task's new state.
///
/// `other_pending` lists the names of the task's *other* pending steps in
/// declaration order, read under the same lock as `task`.
///
/// # Errors
/// [`EngineError::InvalidState`] if the step is already resolved or the
/// task has already reached a terminal status.
pub fn resolve_step(
    task: &TaskInstance,
    step: &HumanStep,
    resolution: &StepResolution,
    other_pending: &[String],
    now: DateTime<Utc>,
) -> Result<(HumanStep, RollUp), EngineError> {
    if step.status != StepStatus::Pending {
        return Err(EngineError::InvalidState(format!(
            "step {} is already {}",
            step.id, step.status
        )));
    }
    if task.status.is_terminal() {
        return Err(EngineError::InvalidState(format!(
            "task {} is already {}",
            task.id, task.status
        )));
    }

    let mut resolved = step.clone();
    resolved.resolved_by = Some(resolution.actor().to_owned());
    resolved.resolved_at = Some(now);

    let rollup = match resolution {
        StepResolution::Submit { content, .. } => {
            resolved.status = StepStatus::Completed;
            resolved.final_content = Some(content.clone());
            after_submit(task, other_pending, now)
        }
        StepResolution::Reject { reason, .. } => {
            resolved.status = StepStatus::Rejected;
            resolved.reject_reason = Some(reason.clone());
            after_reject(task, reason, now)
        }
    };

    Ok((resolved, rollup))
}

/// The last pending step closes the task; otherwise it keeps running and
/// points at the next open checkpoint.
pub fn after_submit(task: &TaskInstance, other_pending: &[String], now: DateTime<Utc>) -> RollUp {
    match other_pending.first() {
        Some(next) => RollUp {
            status: task.status,
            current_step: Some(next.clone()),
            completed_at: task.completed_at,
            finalized: false,
        },
        None => RollUp {
            status: TaskStatus::Completed,
            current_step: Some(COMPLETED_LABEL.into()),
            completed_at: task.completed_at.or(Some(now)),
            finalized: true,
        },
    }
}

/// A single rejection ends the whole task, whatever its other steps say.
pub fn after_reject(task: &TaskInstance, reason: &str, now: DateTime<Utc>) -> RollUp {
    RollUp {
        status: TaskStatus::Rejected,
        current_step: Some(format!("已驳回: {reason}")),
        completed_at: task.completed_at.or(Some(now)),
        finalized: true,
    }
}

/// Force a live task into `failed`.
///
/// # Errors
/// [`EngineError::InvalidState`] unless the task is `pending` or `running`.
pub fn terminate(task: &TaskInstance, reason: &str, now: DateTime<Utc>) -> Result<RollUp, EngineError> {
    if task.status.is_terminal() {
        return Err(EngineError::InvalidState(format!(
            "task {} is already {} and cannot be terminated",
            task.id, task.status
        )));
    }
    let label = match task.current_step.as_deref() {
        Some(current) if !current.is_empty() => format!("{current} (终止原因: {reason})"),
        _ => format!("终止原因: {reason}"),
    };
    Ok(RollUp {
        status: TaskStatus::Failed,
        current_step: Some(label),
        completed_at: task.completed_at.or(Some(now)),
        finalized: true,
    })
}

impl TaskInstance {
    /// Write a roll-up result onto the task. `pending_steps` is the count
    /// after the transition.
    pub fn apply(&mut self, rollup: &RollUp, pending_steps: usize, now: DateTime<Utc>) {
        self.status = rollup.status;
        self.current_step = rollup.current_step.clone();
        self.completed_at = rollup.completed_at;
        self.updated_at = now;
        self.has_human_step = has_human_step(rollup.status, pending_steps);
    }
}
