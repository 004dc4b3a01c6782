//! Task execution engine.
//!
//! `TaskExecutor` is the entry point for everything that happens to a task:
//! 1. `trigger` plans a task from the flow's current graph and persists it
//!    in one unit, then reports to the notification and audit sinks.
//! 2. `submit_step` / `reject_step` close a human checkpoint and roll the
//!    owning task up inside the store's per-task critical section.
//! 3. `terminate` and `urge` are the manual operations on a task.
//!
//! Sink delivery happens in the background and never reaches the caller;
//! see [`Sinks`].

use std::sync::Arc;

use chrono::Utc;
use notify::{AuditEntry, Notification, NotificationKind};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::models::{DagExecutionNode, HumanStep, TaskDag, TaskInstance, TaskStatus};
use crate::planner::{self, Preview, TaskPlan, TriggerRequest};
use crate::rollup::StepResolution;
use crate::sinks::Sinks;
use crate::store::{StepOutcome, Store, TaskPage, TaskQuery, MAX_PAGE_SIZE};
use crate::EngineError;

pub const DEFAULT_TERMINATE_REASON: &str = "手动终止";

pub struct TaskExecutor {
    store: Arc<dyn Store>,
    sinks: Sinks,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn Store>, sinks: Sinks, config: ExecutorConfig) -> Self {
        Self { store, sinks, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Instantiate a task from flow `flow_id`.
    ///
    /// Returns once every node and step record exists. A flow without
    /// reachable human nodes comes back already `completed`.
    ///
    /// # Errors
    /// `NotFound` for an unknown flow, `Validation` for non-object input.
    #[instrument(skip(self, request), fields(flow_id = %flow_id))]
    pub async fn trigger(
        &self,
        flow_id: Uuid,
        request: &TriggerRequest,
        actor: &str,
    ) -> Result<TaskInstance, EngineError> {
        let flow = self.store.get_flow(flow_id).await?;
        let plan = planner::plan_task(&flow, request, &self.config, Utc::now())?;
        let task = self.store.insert_task(&plan).await?;

        info!(
            task_id = %task.id,
            status = %task.status,
            steps = plan.steps.len(),
            skipped = plan.resolution.skipped.len(),
            "task instantiated"
        );

        self.announce(&plan);
        self.sinks.audit(AuditEntry::now(
            actor,
            "task_triggered",
            format!("{} ({}) from {} v{}", task.title, task.id, flow.name, flow.version),
        ));
        Ok(task)
    }

    fn announce(&self, plan: &TaskPlan) {
        let task = &plan.task;
        self.sinks.notify(Notification {
            kind: NotificationKind::TaskStart,
            task_id: task.id,
            step_id: None,
            target: task.assignee.clone().unwrap_or_else(|| self.config.notify_role.clone()),
            title: format!("任务已启动: {}", task.title),
            content: format!("流程「{}」已触发", task.flow_name),
        });

        for checkpoint in &plan.checkpoints {
            self.sinks.notify(Notification {
                kind: NotificationKind::HumanStep,
                task_id: task.id,
                step_id: Some(checkpoint.step_id),
                target: checkpoint.role.clone().unwrap_or_else(|| self.config.notify_role.clone()),
                title: format!("待人工确认: {}", checkpoint.step_name),
                content: task.title.clone(),
            });
        }
    }

    /// What triggering flow `flow_id` with `input` would do, without
    /// creating anything.
    pub async fn preview(&self, flow_id: Uuid, input: &Value) -> Result<Preview, EngineError> {
        let flow = self.store.get_flow(flow_id).await?;
        Ok(planner::preview(&flow.graph, input, self.config.skip_propagation)?)
    }

    pub async fn task(&self, id: Uuid) -> Result<TaskInstance, EngineError> {
        self.store.get_task(id).await
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage, EngineError> {
        self.store.list_tasks(query).await
    }

    /// The assignee's board: their pending and running tasks, oldest first.
    pub async fn my_tasks(&self, assignee: &str) -> Result<TaskPage, EngineError> {
        self.store
            .list_tasks(&TaskQuery {
                statuses: vec![TaskStatus::Pending, TaskStatus::Running],
                assignee: Some(assignee.to_owned()),
                oldest_first: true,
                page_size: MAX_PAGE_SIZE,
                ..TaskQuery::default()
            })
            .await
    }

    pub async fn task_dag(&self, id: Uuid) -> Result<TaskDag, EngineError> {
        let task = self.store.get_task(id).await?;
        let nodes: Vec<DagExecutionNode> = self.store.task_nodes(id).await?;
        Ok(TaskDag::new(task, nodes))
    }

    pub async fn steps(&self, task_id: Uuid) -> Result<Vec<HumanStep>, EngineError> {
        self.store.task_steps(task_id).await
    }

    pub async fn step(&self, id: Uuid) -> Result<HumanStep, EngineError> {
        self.store.get_step(id).await
    }

    /// Accept a human step with `content` as its final text.
    ///
    /// # Errors
    /// `NotFound` for an unknown step, `InvalidState` if it was already
    /// resolved or its task is no longer live.
    #[instrument(skip(self, content), fields(step_id = %step_id))]
    pub async fn submit_step(&self, step_id: Uuid, content: &str, actor: &str) -> Result<StepOutcome, EngineError> {
        let resolution = StepResolution::Submit { content: content.to_owned(), actor: actor.to_owned() };
        let outcome = self.store.resolve_step(step_id, &resolution, Utc::now()).await?;
        self.report(&outcome, "step_submitted", format!("{} submitted", outcome.step.step_name));
        Ok(outcome)
    }

    /// Reject a human step. The owning task is rejected with it.
    #[instrument(skip(self, reason), fields(step_id = %step_id))]
    pub async fn reject_step(&self, step_id: Uuid, reason: &str, actor: &str) -> Result<StepOutcome, EngineError> {
        let resolution = StepResolution::Reject { reason: reason.to_owned(), actor: actor.to_owned() };
        let outcome = self.store.resolve_step(step_id, &resolution, Utc::now()).await?;
        self.report(&outcome, "step_rejected", format!("{} rejected: {reason}", outcome.step.step_name));
        Ok(outcome)
    }

    fn report(&self, outcome: &StepOutcome, action: &str, detail: String) {
        let task = &outcome.task;
        info!(
            task_id = %task.id,
            step = %outcome.step.status,
            task_status = %task.status,
            finalized = outcome.finalized,
            "human step resolved"
        );
        let actor = outcome.step.resolved_by.as_deref().unwrap_or_default();
        self.sinks.audit(AuditEntry::now(actor, action, format!("{detail} (task {})", task.id)));
    }

    /// Force a `pending` or `running` task into `failed`.
    #[instrument(skip(self))]
    pub async fn terminate(&self, task_id: Uuid, reason: Option<&str>, actor: &str) -> Result<TaskInstance, EngineError> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_TERMINATE_REASON);
        let task = self.store.terminate_task(task_id, reason, Utc::now()).await?;
        info!(status = %task.status, "task terminated");
        self.sinks
            .audit(AuditEntry::now(actor, "task_terminated", format!("{} ({}): {reason}", task.title, task.id)));
        Ok(task)
    }

    /// Remind the assignee of a task. Works on tasks in any status and
    /// changes nothing.
    #[instrument(skip(self))]
    pub async fn urge(&self, task_id: Uuid, actor: &str) -> Result<TaskInstance, EngineError> {
        let task = self.store.get_task(task_id).await?;
        let target = task.assignee.clone().unwrap_or_else(|| self.config.notify_role.clone());
        self.sinks.notify(Notification {
            kind: NotificationKind::Reminder,
            task_id: task.id,
            step_id: None,
            target: target.clone(),
            title: format!("催办: {}", task.title),
            content: task
                .current_step
                .clone()
                .unwrap_or_else(|| task.status.to_string()),
        });
        self.sinks
            .audit(AuditEntry::now(actor, "task_urged", format!("{} ({}) -> {target}", task.title, task.id)));
        info!(%target, "task urged");
        Ok(task)
    }
}
