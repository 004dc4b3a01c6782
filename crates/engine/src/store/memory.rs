//! In-memory [`Store`] for tests and single-process use.
//!
//! All state sits behind one `tokio::sync::Mutex`, which makes every trait
//! method a single critical section: version bumps and step roll-ups can
//! never interleave.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{StepOutcome, Store, TaskPage, TaskQuery};
use crate::models::{
    DagExecutionNode, FlowDefinition, FlowDraft, FlowGraph, FlowVersion, HumanStep, StepStatus,
    TaskInstance, Trigger,
};
use crate::planner::TaskPlan;
use crate::rollup::{self, StepResolution};
use crate::EngineError;

#[derive(Default)]
struct State {
    flows: BTreeMap<Uuid, FlowDefinition>,
    versions: HashMap<Uuid, Vec<FlowVersion>>,
    tasks: BTreeMap<Uuid, TaskInstance>,
    nodes: HashMap<Uuid, Vec<DagExecutionNode>>,
    /// Step ids per task, in declaration order.
    task_steps: HashMap<Uuid, Vec<Uuid>>,
    steps: HashMap<Uuid, HumanStep>,
}

impl State {
    fn pending_step_names(&self, task_id: Uuid, except: Option<Uuid>) -> Vec<String> {
        self.task_steps
            .get(&task_id)
            .into_iter()
            .flatten()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.steps.get(id))
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.step_name.clone())
            .collect()
    }

    /// Copy of a task with `has_human_step` derived from its steps.
    fn read_task(&self, id: Uuid) -> Result<TaskInstance, EngineError> {
        let mut task = self
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("task", id))?;
        let pending = self.pending_step_names(id, None).len();
        task.has_human_step = rollup::has_human_step(task.status, pending);
        Ok(task)
    }

    /// Append a version and move the head to it.
    fn push_version(
        &mut self,
        id: Uuid,
        name: &str,
        trigger: &Trigger,
        graph: &FlowGraph,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError> {
        let flow = self
            .flows
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("flow", id))?;
        flow.version += 1;
        flow.name = name.to_owned();
        flow.trigger = trigger.clone();
        flow.graph = graph.clone();
        flow.updated_at = now;
        let head = flow.clone();

        self.versions.entry(id).or_default().push(FlowVersion {
            id: Uuid::new_v4(),
            flow_id: id,
            version: head.version,
            trigger: head.trigger.clone(),
            graph: head.graph.clone(),
            note,
            created_at: now,
        });
        Ok(head)
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_flow(&self, draft: &FlowDraft, now: DateTime<Utc>) -> Result<FlowDefinition, EngineError> {
        let mut state = self.state.lock().await;

        let existing = state.flows.values().find(|f| f.name == draft.name).map(|f| f.id);
        if let Some(id) = existing {
            return state.push_version(id, &draft.name, &draft.trigger, &draft.graph, draft.note.clone(), now);
        }

        let flow = FlowDefinition {
            id: Uuid::new_v4(),
            name: draft.name.clone(),
            version: 1,
            trigger: draft.trigger.clone(),
            graph: draft.graph.clone(),
            created_at: now,
            updated_at: now,
        };
        state.versions.insert(
            flow.id,
            vec![FlowVersion {
                id: Uuid::new_v4(),
                flow_id: flow.id,
                version: 1,
                trigger: flow.trigger.clone(),
                graph: flow.graph.clone(),
                note: draft.note.clone(),
                created_at: now,
            }],
        );
        state.flows.insert(flow.id, flow.clone());
        Ok(flow)
    }

    async fn update_flow(
        &self,
        id: Uuid,
        draft: &FlowDraft,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError> {
        let mut state = self.state.lock().await;
        if state.flows.values().any(|f| f.name == draft.name && f.id != id) {
            return Err(EngineError::InvalidState(format!(
                "another flow is already named '{}'",
                draft.name
            )));
        }
        state.push_version(id, &draft.name, &draft.trigger, &draft.graph, draft.note.clone(), now)
    }

    async fn rollback_flow(
        &self,
        id: Uuid,
        version: i32,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError> {
        let mut state = self.state.lock().await;
        let name = state
            .flows
            .get(&id)
            .map(|f| f.name.clone())
            .ok_or_else(|| EngineError::not_found("flow", id))?;
        let (trigger, graph) = state
            .versions
            .get(&id)
            .and_then(|vs| vs.iter().find(|v| v.version == version))
            .map(|v| (v.trigger.clone(), v.graph.clone()))
            .ok_or_else(|| EngineError::not_found("flow version", format!("{id} v{version}")))?;

        state.push_version(id, &name, &trigger, &graph, Some(format!("rollback to v{version}")), now)
    }

    async fn get_flow(&self, id: Uuid) -> Result<FlowDefinition, EngineError> {
        let state = self.state.lock().await;
        state.flows.get(&id).cloned().ok_or_else(|| EngineError::not_found("flow", id))
    }

    async fn list_flows(&self) -> Result<Vec<FlowDefinition>, EngineError> {
        let state = self.state.lock().await;
        let mut flows: Vec<_> = state.flows.values().cloned().collect();
        flows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(flows)
    }

    async fn list_versions(&self, flow_id: Uuid) -> Result<Vec<FlowVersion>, EngineError> {
        let state = self.state.lock().await;
        if !state.flows.contains_key(&flow_id) {
            return Err(EngineError::not_found("flow", flow_id));
        }
        Ok(state.versions.get(&flow_id).cloned().unwrap_or_default())
    }

    async fn get_version(&self, flow_id: Uuid, version: i32) -> Result<FlowVersion, EngineError> {
        let state = self.state.lock().await;
        if !state.flows.contains_key(&flow_id) {
            return Err(EngineError::not_found("flow", flow_id));
        }
        state
            .versions
            .get(&flow_id)
            .and_then(|vs| vs.iter().find(|v| v.version == version))
            .cloned()
            .ok_or_else(|| EngineError::not_found("flow version", format!("{flow_id} v{version}")))
    }

    async fn insert_task(&self, plan: &TaskPlan) -> Result<TaskInstance, EngineError> {
        let mut state = self.state.lock().await;
        let task_id = plan.task.id;
        state.tasks.insert(task_id, plan.task.clone());
        state.nodes.insert(task_id, plan.nodes.clone());
        state
            .task_steps
            .insert(task_id, plan.steps.iter().map(|s| s.id).collect());
        for step in &plan.steps {
            state.steps.insert(step.id, step.clone());
        }
        state.read_task(task_id)
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskInstance, EngineError> {
        self.state.lock().await.read_task(id)
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage, EngineError> {
        query.validate()?;
        let state = self.state.lock().await;
        let needle = query.search_term().map(str::to_lowercase);

        let mut matching = Vec::new();
        for id in state.tasks.keys() {
            let task = state.read_task(*id)?;
            if !query.statuses.is_empty() && !query.statuses.contains(&task.status) {
                continue;
            }
            if query.assignee.is_some() && task.assignee != query.assignee {
                continue;
            }
            if let Some(needle) = &needle {
                let hit = task.title.to_lowercase().contains(needle)
                    || task.flow_name.to_lowercase().contains(needle);
                if !hit {
                    continue;
                }
            }
            matching.push(task);
        }

        matching.sort_by(|a, b| {
            let ord = a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
            if query.oldest_first { ord } else { ord.reverse() }
        });
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size as usize)
            .collect();
        Ok(TaskPage::new(items, total, query))
    }

    async fn task_nodes(&self, task_id: Uuid) -> Result<Vec<DagExecutionNode>, EngineError> {
        let state = self.state.lock().await;
        state
            .nodes
            .get(&task_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("task", task_id))
    }

    async fn task_steps(&self, task_id: Uuid) -> Result<Vec<HumanStep>, EngineError> {
        let state = self.state.lock().await;
        let ids = state
            .task_steps
            .get(&task_id)
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        Ok(ids.iter().filter_map(|id| state.steps.get(id)).cloned().collect())
    }

    async fn get_step(&self, id: Uuid) -> Result<HumanStep, EngineError> {
        let state = self.state.lock().await;
        state.steps.get(&id).cloned().ok_or_else(|| EngineError::not_found("step", id))
    }

    async fn resolve_step(
        &self,
        step_id: Uuid,
        resolution: &StepResolution,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError> {
        let mut state = self.state.lock().await;
        let step = state
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("step", step_id))?;
        let task = state.read_task(step.task_id)?;
        let others = state.pending_step_names(task.id, Some(step_id));

        let (resolved, rollup) = rollup::resolve_step(&task, &step, resolution, &others, now)?;
        state.steps.insert(step_id, resolved.clone());

        let pending = state.pending_step_names(task.id, None).len();
        let mut updated = task;
        updated.apply(&rollup, pending, now);
        state.tasks.insert(updated.id, updated.clone());

        Ok(StepOutcome { step: resolved, task: updated, finalized: rollup.finalized })
    }

    async fn terminate_task(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance, EngineError> {
        let mut state = self.state.lock().await;
        let mut task = state.read_task(id)?;
        let rollup = rollup::terminate(&task, reason, now)?;
        let pending = state.pending_step_names(id, None).len();
        task.apply(&rollup, pending, now);
        state.tasks.insert(id, task.clone());
        Ok(task)
    }
}
