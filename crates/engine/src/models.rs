//! Core domain models for flows and the tasks instantiated from them.
//!
//! A [`FlowDefinition`] is the live head of a named template; every save
//! appends an immutable [`FlowVersion`]. Triggering a flow bakes the graph
//! into a [`TaskInstance`] plus one [`DagExecutionNode`] per flow node and
//! one [`HumanStep`] per reachable human node, so later flow edits never
//! rewrite task history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless status enum
/// so it can round-trip through a text column.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a flow is started. Pure metadata: nothing in the engine fires cron
/// flows on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Cron {
        /// Standard cron expression (5 fields).
        expression: String,
    },
}

// ---------------------------------------------------------------------------
// Flow graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Executes synchronously with no human input.
    Auto,
    /// Requires a person to submit or reject.
    Human,
    /// Branches on the trigger input.
    Condition,
}

text_enum!(NodeType { Auto => "auto", Human => "human", Condition => "condition" });

/// Canvas coordinates, kept only for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single step in the flow graph.
///
/// Deserializes from the flat shape written here or from the flow editor's
/// shape, where label, kind and config sit under `data` as
/// `{label, nodeType, config}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFlowNode")]
pub struct FlowNode {
    /// Unique identifier within this flow (referenced by edges).
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    #[serde(default)]
    pub position: Position,
    /// Type-specific configuration, see [`HumanConfig`] and [`ConditionConfig`].
    #[serde(default)]
    pub config: Value,
}

/// Editor payload nested under a node's `data`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EditorData {
    label: Option<String>,
    node_type: Option<NodeType>,
    config: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawFlowNode {
    id: String,
    #[serde(rename = "type")]
    node_type: Option<NodeType>,
    label: Option<String>,
    #[serde(default)]
    position: Position,
    config: Option<Value>,
    data: Option<EditorData>,
}

impl TryFrom<RawFlowNode> for FlowNode {
    type Error = String;

    fn try_from(raw: RawFlowNode) -> Result<Self, Self::Error> {
        let data = raw.data.unwrap_or_default();
        let node_type = data
            .node_type
            .or(raw.node_type)
            .ok_or_else(|| format!("node '{}' has no type", raw.id))?;
        Ok(Self {
            label: raw.label.or(data.label).unwrap_or_else(|| raw.id.clone()),
            config: raw.config.or(data.config).unwrap_or(Value::Null),
            id: raw.id,
            node_type,
            position: raw.position,
        })
    }
}

impl FlowNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            label: label.into(),
            position: Position::default(),
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Human-node view of `config`. Unknown or malformed fields fall back
    /// to their defaults.
    pub fn human_config(&self) -> HumanConfig {
        serde_json::from_value(self.config.clone()).unwrap_or_default()
    }

    /// The boolean expression of a condition node, if one is configured.
    pub fn condition_expression(&self) -> Option<String> {
        serde_json::from_value::<ConditionConfig>(self.config.clone())
            .ok()
            .map(|c| c.expression)
            .filter(|e| !e.trim().is_empty())
    }
}

/// Configuration carried by a human node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanConfig {
    /// Role notified when the checkpoint is reached.
    pub role: Option<String>,
    pub instructions: Option<String>,
    pub background: Option<String>,
    /// Templated AI proposal; `{{key}}` placeholders come from the trigger input.
    pub ai_suggestion: Option<String>,
    /// Advisory only, never enforced.
    pub timeout: Option<u32>,
}

/// Configuration carried by a condition node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionConfig {
    pub expression: String,
}

/// Which side of a condition an edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    True,
    False,
}

impl Branch {
    pub fn taken_when(self) -> bool {
        matches!(self, Self::True)
    }
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
    /// Only meaningful when `source` is a condition node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into(), branch: None }
    }

    pub fn on(mut self, branch: Branch) -> Self {
        self.branch = Some(branch);
        self
    }
}

/// Nodes in declaration order plus the edges between them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn new(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Incoming edges of `id`, in edge declaration order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }
}

// ---------------------------------------------------------------------------
// Flow definition / versions
// ---------------------------------------------------------------------------

/// The live head of a flow: always mirrors its highest version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub trigger: Trigger,
    #[serde(flatten)]
    pub graph: FlowGraph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable snapshot appended on every save or rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub version: i32,
    /// Trigger metadata as saved with this version.
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(flatten)]
    pub graph: FlowGraph,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied content for a save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDraft {
    pub name: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(flatten)]
    pub graph: FlowGraph,
    /// Stored on the version this save appends.
    #[serde(default)]
    pub note: Option<String>,
}

impl FlowDraft {
    pub fn new(name: impl Into<String>, graph: FlowGraph) -> Self {
        Self { name: name.into(), trigger: Trigger::Manual, graph, note: None }
    }
}

// ---------------------------------------------------------------------------
// Task instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Rejected,
}

text_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Rejected => "rejected",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }
}

/// One concrete run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: Uuid,
    pub title: String,
    /// Label only; the task does not reference a specific flow version.
    pub flow_name: String,
    pub status: TaskStatus,
    /// Label of the checkpoint the task is waiting on, or its closing note.
    pub current_step: Option<String>,
    /// Derived on read, never stored.
    pub has_human_step: bool,
    pub assignee: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// DAG execution node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

text_enum!(NodeStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

/// The per-task record of one flow node's runtime status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagExecutionNode {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Matches the `FlowNode::id` this record was created from.
    pub node_key: String,
    pub label: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    /// Predecessor node keys, copied from the flow's edges.
    pub source_keys: Vec<String>,
    pub log: Option<String>,
    pub error: Option<String>,
    pub position: Position,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Human step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Rejected,
}

text_enum!(StepStatus {
    Pending => "pending",
    Completed => "completed",
    Rejected => "rejected",
});

/// The per-task record of one human checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanStep {
    pub id: Uuid,
    pub task_id: Uuid,
    pub node_key: String,
    pub step_name: String,
    pub background_info: Option<String>,
    pub instructions: Option<String>,
    pub ai_suggestion: Option<String>,
    pub status: StepStatus,
    /// Set only on `completed`.
    pub final_content: Option<String>,
    /// Set only on `rejected`.
    pub reject_reason: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// Edge reconstructed from a node's `source_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEdge {
    pub source: String,
    pub target: String,
}

/// A task together with its execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDag {
    pub task: TaskInstance,
    pub nodes: Vec<DagExecutionNode>,
    pub edges: Vec<DagEdge>,
}

impl TaskDag {
    pub fn new(task: TaskInstance, nodes: Vec<DagExecutionNode>) -> Self {
        let edges = nodes
            .iter()
            .flat_map(|n| {
                n.source_keys.iter().map(move |s| DagEdge {
                    source: s.clone(),
                    target: n.node_key.clone(),
                })
            })
            .collect();
        Self { task, nodes, edges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flow_node_parses_flat_shape() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "gen-3",
            "type": "human",
            "label": "通知老板确认",
            "position": {"x": 200.0, "y": 360.0},
            "config": {"role": "manager", "instructions": "", "timeout": 24}
        }))
        .expect("node");

        assert_eq!(node.node_type, NodeType::Human);
        let cfg = node.human_config();
        assert_eq!(cfg.role.as_deref(), Some("manager"));
        assert_eq!(cfg.timeout, Some(24));
    }

    #[test]
    fn flow_node_parses_editor_shape() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "gen-2",
            "type": "condition",
            "position": {"x": 200, "y": 220},
            "data": {"label": "检测异常", "nodeType": "condition", "config": {"expression": "amount > 1000"}}
        }))
        .expect("node");

        assert_eq!(node.node_type, NodeType::Condition);
        assert_eq!(node.label, "检测异常");
        assert_eq!(node.position, Position { x: 200.0, y: 220.0 });
        assert_eq!(node.condition_expression().as_deref(), Some("amount > 1000"));

        // Serializes back to the flat shape.
        let flat = serde_json::to_value(&node).unwrap();
        assert_eq!(flat["label"], "检测异常");
        assert!(flat.get("data").is_none());
    }

    #[test]
    fn flow_node_without_any_type_is_rejected() {
        let err = serde_json::from_value::<FlowNode>(json!({"id": "x", "data": {"label": "?"}})).unwrap_err();
        assert!(err.to_string().contains("has no type"));
    }

    #[test]
    fn blank_condition_expression_is_treated_as_missing() {
        let node = FlowNode::new("c", NodeType::Condition, "判断")
            .with_config(json!({"expression": "  "}));
        assert_eq!(node.condition_expression(), None);
    }

    #[test]
    fn status_text_round_trips() {
        for s in ["pending", "running", "completed", "failed", "rejected"] {
            let status: TaskStatus = s.parse().expect("status");
            assert_eq!(status.as_str(), s);
        }
        assert!("done".parse::<StepStatus>().is_err());
    }

    #[test]
    fn dag_edges_come_from_source_keys() {
        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let node = |key: &str, sources: &[&str]| DagExecutionNode {
            id: Uuid::new_v4(),
            task_id,
            node_key: key.into(),
            label: key.into(),
            node_type: NodeType::Auto,
            status: NodeStatus::Completed,
            source_keys: sources.iter().map(|s| s.to_string()).collect(),
            log: None,
            error: None,
            position: Position::default(),
            started_at: Some(now),
            finished_at: Some(now),
        };
        let task = TaskInstance {
            id: task_id,
            title: "t".into(),
            flow_name: "f".into(),
            status: TaskStatus::Completed,
            current_step: None,
            has_human_step: false,
            assignee: None,
            due_date: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        };

        let dag = TaskDag::new(task, vec![node("a", &[]), node("b", &["a"]), node("c", &["a", "b"])]);
        assert_eq!(dag.edges.len(), 3);
        assert_eq!(dag.edges[0], DagEdge { source: "a".into(), target: "b".into() });
    }
}
