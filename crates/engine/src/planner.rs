//! Task instantiation: turns one trigger of a flow into the full set of
//! records a task starts life with.
//!
//! Planning is pure. [`plan_task`] never touches storage; the caller hands
//! the resulting [`TaskPlan`] to a [`crate::store::Store`] which writes it
//! atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::condition::{self, BranchResolution, SkipPropagation};
use crate::config::ExecutorConfig;
use crate::dag::validate_graph;
use crate::models::{
    DagExecutionNode, FlowDefinition, FlowGraph, FlowNode, HumanStep, NodeStatus, NodeType,
    StepStatus, TaskInstance,
};
use crate::rollup;
use crate::template;
use crate::{EngineError, ValidationError};

/// Where a trigger came from. Only affects the task title.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerOrigin {
    #[default]
    Manual,
    /// An accepted AI suggestion.
    Suggestion { title: String },
}

impl TriggerOrigin {
    pub fn task_title(&self, flow_name: &str) -> String {
        match self {
            Self::Manual => format!("[手动触发] {flow_name}"),
            Self::Suggestion { title } => format!("[AI建议] {title}"),
        }
    }
}

/// Everything a caller may say about one trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerRequest {
    /// Key/value input for condition expressions and `{{key}}` templates.
    /// Must be a JSON object or null.
    pub input: Value,
    pub origin: TriggerOrigin,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

impl TriggerRequest {
    pub fn manual(input: Value) -> Self {
        Self { input, ..Self::default() }
    }
}

/// A human checkpoint reached at instantiation, with the role to notify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub step_id: Uuid,
    pub step_name: String,
    pub role: Option<String>,
}

/// The records of a freshly triggered task, ready to be persisted.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub task: TaskInstance,
    /// One per flow node, in declaration order.
    pub nodes: Vec<DagExecutionNode>,
    /// One per non-skipped human node, in declaration order.
    pub steps: Vec<HumanStep>,
    pub checkpoints: Vec<Checkpoint>,
    pub resolution: BranchResolution,
}

/// What a trigger would do, without creating anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    /// Topological order of the flow's nodes.
    pub order: Vec<String>,
    pub resolution: BranchResolution,
    /// Names of the human steps that would be created.
    pub human_steps: Vec<String>,
}

/// Normalise trigger input to a key/value map.
///
/// # Errors
/// [`ValidationError::InvalidInput`] for anything but an object or null.
pub fn input_map(input: &Value) -> Result<Map<String, Value>, ValidationError> {
    match input {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(ValidationError::InvalidInput(format!(
            "expected an object of named inputs, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Resolve a graph against an input and report what a trigger would create.
pub fn preview(
    graph: &FlowGraph,
    input: &Value,
    propagation: SkipPropagation,
) -> Result<Preview, ValidationError> {
    let inputs = input_map(input)?;
    let order = validate_graph(graph)?;
    let resolution = condition::resolve(graph, &order, &inputs, propagation);
    let human_steps = graph
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Human && !resolution.is_skipped(&n.id))
        .map(|n| n.label.clone())
        .collect();
    Ok(Preview { order, resolution, human_steps })
}

/// Build every record of a new task from the flow's current graph.
///
/// # Errors
/// [`EngineError::Validation`] if the input is not an object or the stored
/// graph is no longer a valid DAG.
pub fn plan_task(
    flow: &FlowDefinition,
    request: &TriggerRequest,
    config: &ExecutorConfig,
    now: DateTime<Utc>,
) -> Result<TaskPlan, EngineError> {
    let inputs = input_map(&request.input)?;
    let graph = &flow.graph;
    let order = validate_graph(graph)?;
    let resolution = condition::resolve(graph, &order, &inputs, config.skip_propagation);

    let task_id = Uuid::new_v4();
    let mut nodes = Vec::with_capacity(graph.nodes.len());
    let mut steps = Vec::new();
    let mut checkpoints = Vec::new();

    for node in &graph.nodes {
        let mut record = DagExecutionNode {
            id: Uuid::new_v4(),
            task_id,
            node_key: node.id.clone(),
            label: node.label.clone(),
            node_type: node.node_type,
            status: NodeStatus::Pending,
            source_keys: graph.incoming(&node.id).map(|e| e.source.clone()).collect(),
            log: None,
            error: None,
            position: node.position,
            started_at: None,
            finished_at: None,
        };

        if resolution.is_skipped(&node.id) {
            record.status = NodeStatus::Skipped;
            record.log = Some(skip_log(graph, node));
            nodes.push(record);
            continue;
        }

        match node.node_type {
            NodeType::Human => {
                record.status = NodeStatus::Pending;
                record.started_at = Some(now);
                record.log = Some("waiting for human review".into());

                let step = human_step(task_id, node, &inputs, now);
                checkpoints.push(Checkpoint {
                    step_id: step.id,
                    step_name: step.step_name.clone(),
                    role: node.human_config().role.filter(|r| !r.trim().is_empty()),
                });
                steps.push(step);
            }
            NodeType::Auto => {
                record.status = NodeStatus::Completed;
                record.started_at = Some(now);
                record.finished_at = Some(now);
                record.log = Some("executed automatically".into());
            }
            NodeType::Condition => {
                record.status = NodeStatus::Completed;
                record.started_at = Some(now);
                record.finished_at = Some(now);
                record.log = resolution.decisions.get(&node.id).map(|d| {
                    let taken = if d.taken { "true" } else { "false" };
                    match &d.fallback_reason {
                        Some(reason) => format!("took the {taken} branch by default ({reason})"),
                        None => format!("took the {taken} branch"),
                    }
                });
            }
        }
        nodes.push(record);
    }

    let pending: Vec<String> = steps.iter().map(|s| s.step_name.clone()).collect();
    let rollup = rollup::after_instantiation(&pending, now);
    let assignee = request.assignee.clone().or_else(|| config.default_assignee.clone());
    let due_date = request
        .due_date
        .or_else(|| config.due_offset().and_then(|offset| now.checked_add_signed(offset)));

    let task = TaskInstance {
        id: task_id,
        title: request.origin.task_title(&flow.name),
        flow_name: flow.name.clone(),
        status: rollup.status,
        current_step: rollup.current_step,
        has_human_step: rollup::has_human_step(rollup.status, pending.len()),
        assignee,
        due_date,
        created_at: now,
        updated_at: now,
        completed_at: rollup.completed_at,
    };

    Ok(TaskPlan { task, nodes, steps, checkpoints, resolution })
}

fn human_step(task_id: Uuid, node: &FlowNode, inputs: &Map<String, Value>, now: DateTime<Utc>) -> HumanStep {
    let config = node.human_config();
    let render = |text: Option<String>| {
        text.filter(|t| !t.trim().is_empty()).map(|t| template::render(&t, inputs))
    };
    let ai_suggestion = render(config.ai_suggestion)
        .unwrap_or_else(|| format!("AI 建议：请核对「{}」的相关信息后确认处理。", node.label));

    HumanStep {
        id: Uuid::new_v4(),
        task_id,
        node_key: node.id.clone(),
        step_name: node.label.clone(),
        background_info: render(config.background),
        instructions: render(config.instructions),
        ai_suggestion: Some(ai_suggestion),
        status: StepStatus::Pending,
        final_content: None,
        reject_reason: None,
        resolved_by: None,
        resolved_at: None,
        created_at: now,
    }
}

fn skip_log(graph: &FlowGraph, node: &FlowNode) -> String {
    let sources: Vec<&str> = graph.incoming(&node.id).map(|e| e.source.as_str()).collect();
    format!("skipped: no live path from {}", sources.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Branch, FlowEdge, Trigger};
    use crate::models::TaskStatus;
    use chrono::Duration;
    use serde_json::json;

    fn flow(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: Uuid::new_v4(),
            name: "采购审核流程".into(),
            version: 1,
            trigger: Trigger::Manual,
            graph: FlowGraph::new(nodes, edges),
            created_at: now,
            updated_at: now,
        }
    }

    fn purchase_flow() -> FlowDefinition {
        flow(
            vec![
                FlowNode::new("collect", NodeType::Auto, "采集数据"),
                FlowNode::new("review", NodeType::Human, "审核").with_config(json!({
                    "role": "finance",
                    "ai_suggestion": "建议向{{supplier}}采购 {{amount}} 元"
                })),
            ],
            vec![FlowEdge::new("collect", "review")],
        )
    }

    fn amount_flow() -> FlowDefinition {
        flow(
            vec![
                FlowNode::new("check", NodeType::Condition, "金额判断")
                    .with_config(json!({ "expression": "amount > 1000" })),
                FlowNode::new("boss", NodeType::Human, "老板审批"),
                FlowNode::new("auto_ok", NodeType::Auto, "自动通过"),
            ],
            vec![
                FlowEdge::new("check", "boss").on(Branch::True),
                FlowEdge::new("check", "auto_ok").on(Branch::False),
            ],
        )
    }

    #[test]
    fn human_flow_plans_running_task_with_one_step() {
        let now = Utc::now();
        let plan = plan_task(
            &purchase_flow(),
            &TriggerRequest::manual(json!({"supplier": "供应商A", "amount": 1200})),
            &ExecutorConfig::default(),
            now,
        )
        .unwrap();

        assert_eq!(plan.task.status, TaskStatus::Running);
        assert!(plan.task.has_human_step);
        assert_eq!(plan.task.completed_at, None);
        assert_eq!(plan.task.title, "[手动触发] 采购审核流程");
        assert_eq!(plan.task.current_step.as_deref(), Some("审核"));

        let statuses: Vec<_> = plan.nodes.iter().map(|n| (n.node_key.as_str(), n.status)).collect();
        assert_eq!(statuses, vec![("collect", NodeStatus::Completed), ("review", NodeStatus::Pending)]);
        assert_eq!(plan.nodes[1].source_keys, vec!["collect".to_string()]);

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].ai_suggestion.as_deref(), Some("建议向供应商A采购 1200 元"));
        assert_eq!(plan.checkpoints[0].role.as_deref(), Some("finance"));
        assert!(plan.steps.iter().all(|s| s.task_id == plan.task.id));
    }

    #[test]
    fn flow_without_human_nodes_completes_immediately() {
        let now = Utc::now();
        let f = flow(
            vec![FlowNode::new("a", NodeType::Auto, "a"), FlowNode::new("b", NodeType::Auto, "b")],
            vec![FlowEdge::new("a", "b")],
        );
        let plan = plan_task(&f, &TriggerRequest::default(), &ExecutorConfig::default(), now).unwrap();

        assert_eq!(plan.task.status, TaskStatus::Completed);
        assert_eq!(plan.task.completed_at, Some(now));
        assert!(!plan.task.has_human_step);
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn false_condition_skips_true_branch_human_node() {
        let plan = plan_task(
            &amount_flow(),
            &TriggerRequest::manual(json!({"amount": 500})),
            &ExecutorConfig::default(),
            Utc::now(),
        )
        .unwrap();

        let boss = plan.nodes.iter().find(|n| n.node_key == "boss").unwrap();
        let auto_ok = plan.nodes.iter().find(|n| n.node_key == "auto_ok").unwrap();
        assert_eq!(boss.status, NodeStatus::Skipped);
        assert_eq!(auto_ok.status, NodeStatus::Completed);
        assert!(plan.steps.is_empty());
        assert_eq!(plan.task.status, TaskStatus::Completed);
    }

    #[test]
    fn true_condition_creates_step_on_true_branch() {
        let plan = plan_task(
            &amount_flow(),
            &TriggerRequest::manual(json!({"amount": 5000})),
            &ExecutorConfig::default(),
            Utc::now(),
        )
        .unwrap();

        let auto_ok = plan.nodes.iter().find(|n| n.node_key == "auto_ok").unwrap();
        assert_eq!(auto_ok.status, NodeStatus::Skipped);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].node_key, "boss");
        assert_eq!(plan.task.status, TaskStatus::Running);
    }

    #[test]
    fn missing_input_falls_back_to_true_branch() {
        let plan = plan_task(
            &amount_flow(),
            &TriggerRequest::default(),
            &ExecutorConfig::default(),
            Utc::now(),
        )
        .unwrap();

        let check = plan.nodes.iter().find(|n| n.node_key == "check").unwrap();
        assert!(check.log.as_deref().unwrap().contains("by default"));
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn non_object_input_is_rejected() {
        let err = plan_task(
            &purchase_flow(),
            &TriggerRequest::manual(json!([1, 2])),
            &ExecutorConfig::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::InvalidInput(_))));
    }

    #[test]
    fn suggestion_origin_and_config_defaults_shape_the_task() {
        let now = Utc::now();
        let config = ExecutorConfig {
            default_assignee: Some("ops".into()),
            default_due_hours: Some(24),
            ..ExecutorConfig::default()
        };
        let request = TriggerRequest {
            origin: TriggerOrigin::Suggestion { title: "补货建议".into() },
            ..TriggerRequest::default()
        };
        let plan = plan_task(&purchase_flow(), &request, &config, now).unwrap();

        assert_eq!(plan.task.title, "[AI建议] 补货建议");
        assert_eq!(plan.task.assignee.as_deref(), Some("ops"));
        assert_eq!(plan.task.due_date, Some(now + Duration::hours(24)));
    }

    #[test]
    fn out_of_range_default_due_hours_leave_no_due_date() {
        for hours in [i64::MAX, i64::MIN, 9_000_000_000] {
            let config = ExecutorConfig { default_due_hours: Some(hours), ..ExecutorConfig::default() };
            let plan = plan_task(&purchase_flow(), &TriggerRequest::default(), &config, Utc::now()).unwrap();
            assert_eq!(plan.task.due_date, None, "{hours} hours");
        }
    }

    #[test]
    fn missing_ai_suggestion_gets_a_default() {
        let f = flow(vec![FlowNode::new("h", NodeType::Human, "复核")], vec![]);
        let plan = plan_task(&f, &TriggerRequest::default(), &ExecutorConfig::default(), Utc::now()).unwrap();
        assert!(plan.steps[0].ai_suggestion.as_deref().unwrap().contains("复核"));
    }

    #[test]
    fn preview_lists_surviving_human_steps() {
        let p = preview(&amount_flow().graph, &json!({"amount": 500}), SkipPropagation::Direct).unwrap();
        assert_eq!(p.order[0], "check");
        assert!(p.resolution.is_skipped("boss"));
        assert!(p.human_steps.is_empty());
    }
}
