//! Postgres-backed [`Store`].
//!
//! Every write runs inside one transaction. Version bumps hold the flow's
//! row lock and step roll-ups hold the task's row lock (`SELECT … FOR
//! UPDATE`), so concurrent callers on the same flow or task serialise on
//! the database rather than racing on stale reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use db::models::{DagNodeRow, FlowContent, FlowRow, FlowVersionRow, HumanStepRow, NewTaskRow, TaskRow};
use db::repository::{flows, steps, tasks};
use db::{DbError, DbPool};

use super::{StepOutcome, Store, TaskPage, TaskQuery};
use crate::models::{
    DagExecutionNode, FlowDefinition, FlowDraft, FlowGraph, FlowVersion, HumanStep, StepStatus,
    TaskInstance,
};
use crate::planner::TaskPlan;
use crate::rollup::{self, StepResolution};
use crate::EngineError;

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn try_save_flow(&self, draft: &FlowDraft, now: DateTime<Utc>) -> Result<FlowDefinition, EngineError> {
        let content = draft_columns(draft)?;
        let FlowContent { trigger, nodes, edges } = content.clone();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let row = match flows::lock_flow_by_name(&mut tx, &draft.name).await? {
            Some(existing) => flows::bump_flow(&mut tx, existing.id, &draft.name, trigger, nodes, edges, now).await?,
            None => flows::insert_flow(&mut tx, &draft.name, trigger, nodes, edges, now).await?,
        };
        flows::insert_flow_version(&mut tx, row.id, row.version, &content, draft.note.as_deref(), now).await?;

        tx.commit().await.map_err(DbError::from)?;
        flow_from_row(row)
    }
}

/// Map the repository's generic `NotFound` onto the entity being looked up.
fn missing(entity: &'static str, id: impl ToString) -> impl FnOnce(DbError) -> EngineError {
    move |err| match err {
        DbError::NotFound => EngineError::not_found(entity, id.to_string()),
        other => other.into(),
    }
}

fn decode<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::Corrupt(format!("{what}: {e}")))
}

fn parse<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, EngineError> {
    value.parse().map_err(EngineError::Corrupt)
}

fn draft_columns(draft: &FlowDraft) -> Result<FlowContent, EngineError> {
    Ok(FlowContent {
        trigger: serde_json::to_value(&draft.trigger).map_err(DbError::from)?,
        nodes: serde_json::to_value(&draft.graph.nodes).map_err(DbError::from)?,
        edges: serde_json::to_value(&draft.graph.edges).map_err(DbError::from)?,
    })
}

fn graph_from_columns(nodes: serde_json::Value, edges: serde_json::Value) -> Result<FlowGraph, EngineError> {
    Ok(FlowGraph::new(decode("flow nodes", nodes)?, decode("flow edges", edges)?))
}

fn flow_from_row(row: FlowRow) -> Result<FlowDefinition, EngineError> {
    Ok(FlowDefinition {
        id: row.id,
        name: row.name,
        version: row.version,
        trigger: decode("flow trigger", row.trigger)?,
        graph: graph_from_columns(row.nodes, row.edges)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn version_from_row(row: FlowVersionRow) -> Result<FlowVersion, EngineError> {
    Ok(FlowVersion {
        id: row.id,
        flow_id: row.flow_id,
        version: row.version,
        trigger: decode("flow version trigger", row.trigger)?,
        graph: graph_from_columns(row.nodes, row.edges)?,
        note: row.note,
        created_at: row.created_at,
    })
}

fn task_from_row(row: TaskRow) -> Result<TaskInstance, EngineError> {
    let status = parse(&row.status)?;
    Ok(TaskInstance {
        id: row.id,
        title: row.title,
        flow_name: row.flow_name,
        status,
        current_step: row.current_step,
        has_human_step: rollup::has_human_step(status, row.pending_steps.max(0) as usize),
        assignee: row.assignee,
        due_date: row.due_date,
        created_at: row.created_at,
        updated_at: row.updated_at,
        completed_at: row.completed_at,
    })
}

fn node_from_row(row: DagNodeRow) -> Result<DagExecutionNode, EngineError> {
    Ok(DagExecutionNode {
        id: row.id,
        task_id: row.task_id,
        node_key: row.node_key,
        label: row.label,
        node_type: parse(&row.node_type)?,
        status: parse(&row.status)?,
        source_keys: row.source_keys,
        log: row.log,
        error: row.error,
        position: decode("node position", row.position)?,
        started_at: row.started_at,
        finished_at: row.finished_at,
    })
}

fn node_to_row(seq: usize, node: &DagExecutionNode) -> Result<DagNodeRow, EngineError> {
    Ok(DagNodeRow {
        id: node.id,
        task_id: node.task_id,
        seq: seq as i32,
        node_key: node.node_key.clone(),
        label: node.label.clone(),
        node_type: node.node_type.to_string(),
        status: node.status.to_string(),
        source_keys: node.source_keys.clone(),
        log: node.log.clone(),
        error: node.error.clone(),
        position: serde_json::to_value(node.position).map_err(DbError::from)?,
        started_at: node.started_at,
        finished_at: node.finished_at,
    })
}

fn step_from_row(row: HumanStepRow) -> Result<HumanStep, EngineError> {
    Ok(HumanStep {
        id: row.id,
        task_id: row.task_id,
        node_key: row.node_key,
        step_name: row.step_name,
        background_info: row.background_info,
        instructions: row.instructions,
        ai_suggestion: row.ai_suggestion,
        status: parse(&row.status)?,
        final_content: row.final_content,
        reject_reason: row.reject_reason,
        resolved_by: row.resolved_by,
        resolved_at: row.resolved_at,
        created_at: row.created_at,
    })
}

fn step_to_row(seq: usize, step: &HumanStep) -> HumanStepRow {
    HumanStepRow {
        id: step.id,
        task_id: step.task_id,
        seq: seq as i32,
        node_key: step.node_key.clone(),
        step_name: step.step_name.clone(),
        background_info: step.background_info.clone(),
        instructions: step.instructions.clone(),
        ai_suggestion: step.ai_suggestion.clone(),
        status: step.status.to_string(),
        final_content: step.final_content.clone(),
        reject_reason: step.reject_reason.clone(),
        resolved_by: step.resolved_by.clone(),
        resolved_at: step.resolved_at,
        created_at: step.created_at,
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_flow(&self, draft: &FlowDraft, now: DateTime<Utc>) -> Result<FlowDefinition, EngineError> {
        match self.try_save_flow(draft, now).await {
            // Lost a race to create the same name: the row exists now, so
            // the retry takes the update path.
            Err(EngineError::Database(err)) if err.is_unique_violation() => {
                debug!(name = %draft.name, "concurrent create, retrying as update");
                self.try_save_flow(draft, now).await
            }
            other => other,
        }
    }

    async fn update_flow(
        &self,
        id: Uuid,
        draft: &FlowDraft,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError> {
        let content = draft_columns(draft)?;
        let FlowContent { trigger, nodes, edges } = content.clone();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        flows::lock_flow(&mut tx, id).await.map_err(missing("flow", id))?;
        let row = match flows::bump_flow(&mut tx, id, &draft.name, trigger, nodes, edges, now).await {
            Err(err) if err.is_unique_violation() => {
                return Err(EngineError::InvalidState(format!(
                    "another flow is already named '{}'",
                    draft.name
                )));
            }
            other => other.map_err(missing("flow", id))?,
        };
        flows::insert_flow_version(&mut tx, id, row.version, &content, draft.note.as_deref(), now).await?;

        tx.commit().await.map_err(DbError::from)?;
        flow_from_row(row)
    }

    async fn rollback_flow(
        &self,
        id: Uuid,
        version: i32,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let head = flows::lock_flow(&mut tx, id).await.map_err(missing("flow", id))?;
        let target = flows::get_flow_version(&mut tx, id, version)
            .await
            .map_err(missing("flow version", format!("{id} v{version}")))?;

        let content = FlowContent { trigger: target.trigger, nodes: target.nodes, edges: target.edges };
        let row = flows::bump_flow(
            &mut tx,
            id,
            &head.name,
            content.trigger.clone(),
            content.nodes.clone(),
            content.edges.clone(),
            now,
        )
        .await?;
        let note = format!("rollback to v{version}");
        flows::insert_flow_version(&mut tx, id, row.version, &content, Some(&note), now).await?;

        tx.commit().await.map_err(DbError::from)?;
        flow_from_row(row)
    }

    async fn get_flow(&self, id: Uuid) -> Result<FlowDefinition, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let row = flows::get_flow(&mut conn, id).await.map_err(missing("flow", id))?;
        flow_from_row(row)
    }

    async fn list_flows(&self) -> Result<Vec<FlowDefinition>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        flows::list_flows(&mut conn).await?.into_iter().map(flow_from_row).collect()
    }

    async fn list_versions(&self, flow_id: Uuid) -> Result<Vec<FlowVersion>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        flows::get_flow(&mut conn, flow_id).await.map_err(missing("flow", flow_id))?;
        flows::list_flow_versions(&mut conn, flow_id)
            .await?
            .into_iter()
            .map(version_from_row)
            .collect()
    }

    async fn get_version(&self, flow_id: Uuid, version: i32) -> Result<FlowVersion, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        flows::get_flow(&mut conn, flow_id).await.map_err(missing("flow", flow_id))?;
        let row = flows::get_flow_version(&mut conn, flow_id, version)
            .await
            .map_err(missing("flow version", format!("{flow_id} v{version}")))?;
        version_from_row(row)
    }

    async fn insert_task(&self, plan: &TaskPlan) -> Result<TaskInstance, EngineError> {
        let task = &plan.task;
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        tasks::insert_task(
            &mut tx,
            &NewTaskRow {
                id: task.id,
                title: task.title.clone(),
                flow_name: task.flow_name.clone(),
                status: task.status.to_string(),
                current_step: task.current_step.clone(),
                assignee: task.assignee.clone(),
                due_date: task.due_date,
                created_at: task.created_at,
                completed_at: task.completed_at,
            },
        )
        .await?;
        for (seq, node) in plan.nodes.iter().enumerate() {
            tasks::insert_dag_node(&mut tx, &node_to_row(seq, node)?).await?;
        }
        for (seq, step) in plan.steps.iter().enumerate() {
            steps::insert_step(&mut tx, &step_to_row(seq, step)).await?;
        }

        let row = tasks::get_task(&mut tx, task.id).await?;
        tx.commit().await.map_err(DbError::from)?;
        task_from_row(row)
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskInstance, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let row = tasks::get_task(&mut conn, id).await.map_err(missing("task", id))?;
        task_from_row(row)
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage, EngineError> {
        query.validate()?;
        let filter = tasks::TaskListQuery {
            statuses: query.statuses.iter().map(ToString::to_string).collect(),
            assignee: query.assignee.clone(),
            search: query.search_term().map(str::to_owned),
            oldest_first: query.oldest_first,
            limit: i64::from(query.page_size),
            offset: query.offset() as i64,
        };

        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let (rows, total) = tasks::list_tasks(&mut conn, &filter).await?;
        let items = rows.into_iter().map(task_from_row).collect::<Result<_, _>>()?;
        Ok(TaskPage::new(items, total.max(0) as u64, query))
    }

    async fn task_nodes(&self, task_id: Uuid) -> Result<Vec<DagExecutionNode>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        tasks::get_task(&mut conn, task_id).await.map_err(missing("task", task_id))?;
        tasks::list_dag_nodes(&mut conn, task_id)
            .await?
            .into_iter()
            .map(node_from_row)
            .collect()
    }

    async fn task_steps(&self, task_id: Uuid) -> Result<Vec<HumanStep>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        tasks::get_task(&mut conn, task_id).await.map_err(missing("task", task_id))?;
        steps::list_steps(&mut conn, task_id)
            .await?
            .into_iter()
            .map(step_from_row)
            .collect()
    }

    async fn get_step(&self, id: Uuid) -> Result<HumanStep, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let row = steps::get_step(&mut conn, id).await.map_err(missing("step", id))?;
        step_from_row(row)
    }

    async fn resolve_step(
        &self,
        step_id: Uuid,
        resolution: &StepResolution,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let task_id = steps::get_step(&mut tx, step_id)
            .await
            .map_err(missing("step", step_id))?
            .task_id;
        let task = task_from_row(tasks::lock_task(&mut tx, task_id).await.map_err(missing("task", task_id))?)?;

        // Re-read the task's steps under the lock.
        let siblings = steps::list_steps(&mut tx, task_id)
            .await?
            .into_iter()
            .map(step_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let step = siblings
            .iter()
            .find(|s| s.id == step_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("step", step_id))?;
        let others: Vec<String> = siblings
            .iter()
            .filter(|s| s.id != step_id && s.status == StepStatus::Pending)
            .map(|s| s.step_name.clone())
            .collect();

        let (resolved, rollup) = rollup::resolve_step(&task, &step, resolution, &others, now)?;

        let written = steps::resolve_step(
            &mut tx,
            step_id,
            resolved.status.as_str(),
            resolved.final_content.as_deref(),
            resolved.reject_reason.as_deref(),
            resolution.actor(),
            now,
        )
        .await?;
        if !written {
            return Err(EngineError::InvalidState(format!("step {step_id} is already resolved")));
        }
        tasks::update_task_status(
            &mut tx,
            task_id,
            rollup.status.as_str(),
            rollup.current_step.as_deref(),
            rollup.completed_at,
            now,
        )
        .await?;
        tx.commit().await.map_err(DbError::from)?;

        let mut updated = task;
        updated.apply(&rollup, others.len(), now);
        Ok(StepOutcome { step: resolved, task: updated, finalized: rollup.finalized })
    }

    async fn terminate_task(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance, EngineError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let row = tasks::lock_task(&mut tx, id).await.map_err(missing("task", id))?;
        let pending = row.pending_steps.max(0) as usize;
        let mut task = task_from_row(row)?;
        let rollup = rollup::terminate(&task, reason, now)?;

        tasks::update_task_status(
            &mut tx,
            id,
            rollup.status.as_str(),
            rollup.current_step.as_deref(),
            rollup.completed_at,
            now,
        )
        .await?;
        tx.commit().await.map_err(DbError::from)?;

        task.apply(&rollup, pending, now);
        Ok(task)
    }
}

/// These run against a live database and are skipped by default:
/// `DATABASE_URL=postgres://… cargo test -p engine -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ExecutorConfig;
    use crate::models::{FlowNode, NodeType, TaskStatus};
    use crate::planner::{plan_task, TriggerRequest};

    async fn store() -> Arc<PgStore> {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
        let pool = db::pool::create_pool(&url, 16).await.expect("connect");
        db::pool::run_migrations(&pool).await.expect("migrate");
        Arc::new(PgStore::new(pool))
    }

    fn draft(name: &str, labels: &[&str]) -> FlowDraft {
        let nodes = labels
            .iter()
            .map(|l| FlowNode::new(*l, NodeType::Human, *l))
            .collect();
        FlowDraft::new(name, FlowGraph::new(nodes, vec![]))
    }

    fn unique_name(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn concurrent_resolve_of_last_two_steps_finalizes_once() {
        let store = store().await;
        let flow = store.save_flow(&draft(&unique_name("会签"), &["一审", "二审"]), Utc::now()).await.unwrap();
        let plan = plan_task(&flow, &TriggerRequest::default(), &ExecutorConfig::default(), Utc::now()).unwrap();
        let task = store.insert_task(&plan).await.unwrap();
        let steps = store.task_steps(task.id).await.unwrap();
        assert_eq!(steps.len(), 2);

        let handles: Vec<_> = steps
            .iter()
            .map(|step| {
                let store = store.clone();
                let step_id = step.id;
                tokio::spawn(async move {
                    let submit = StepResolution::Submit { content: "ok".into(), actor: "alice".into() };
                    store.resolve_step(step_id, &submit, Utc::now()).await
                })
            })
            .collect();
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| o.finalized).count(), 1);
        let finished = outcomes.iter().find(|o| o.finalized).unwrap();
        assert_eq!(finished.task.status, TaskStatus::Completed);
        let stored = store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(!stored.has_human_step);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn concurrent_saves_on_one_name_get_contiguous_versions() {
        let store = store().await;
        let name = unique_name("并发保存");
        let writers = 8;

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let store = store.clone();
                let draft = draft(&name, &["一审"]);
                tokio::spawn(async move { store.save_flow(&draft, Utc::now()).await })
            })
            .collect();
        let mut heads = Vec::new();
        for handle in handles {
            heads.push(handle.await.unwrap().unwrap());
        }

        let flow_id = heads[0].id;
        assert!(heads.iter().all(|h| h.id == flow_id));
        let mut seen: Vec<i32> = heads.iter().map(|h| h.version).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=writers).collect::<Vec<_>>());

        let history: Vec<i32> = store.list_versions(flow_id).await.unwrap().iter().map(|v| v.version).collect();
        assert_eq!(history, (1..=writers).collect::<Vec<_>>());
        assert_eq!(store.get_flow(flow_id).await.unwrap().version, writers);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn rollback_restores_the_stored_trigger() {
        let store = store().await;
        let cron = crate::models::Trigger::Cron { expression: "0 9 * * *".into() };
        let mut scheduled = draft(&unique_name("定时"), &["一审"]);
        scheduled.trigger = cron.clone();
        let v1 = store.save_flow(&scheduled, Utc::now()).await.unwrap();
        store.save_flow(&draft(&scheduled.name, &["一审"]), Utc::now()).await.unwrap();

        let head = store.rollback_flow(v1.id, 1, Utc::now()).await.unwrap();
        assert_eq!(head.trigger, cron);
        assert_eq!(store.get_version(v1.id, 3).await.unwrap().trigger, cron);
    }
}
