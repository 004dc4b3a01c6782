//! Branch resolution: decides, once per trigger, which nodes of a flow are
//! cut off by the non-taken side of a condition.
//!
//! A condition whose expression is missing, fails to parse, references an
//! undefined input or cannot be evaluated resolves to its `true` branch.
//! The failure is logged and recorded on the decision, never returned, so
//! a malformed flow still instantiates.

pub mod expression;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{FlowEdge, FlowGraph, NodeType};

pub use expression::{Expr, ExpressionError};

/// How far a non-taken branch reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPropagation {
    /// Only the direct targets of non-taken branch edges are skipped; their
    /// own successors still run. This matches how existing flows behave.
    #[default]
    Direct,
    /// Anything whose every predecessor is skipped is skipped as well.
    Transitive,
}

/// Outcome of one condition node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Which branch is taken.
    pub taken: bool,
    /// Set when `taken` is the `true` fallback rather than a real result.
    pub fallback_reason: Option<String>,
}

/// Result of resolving every condition of a flow against one input.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BranchResolution {
    pub decisions: BTreeMap<String, Decision>,
    pub skipped: BTreeSet<String>,
}

impl BranchResolution {
    pub fn is_skipped(&self, node_id: &str) -> bool {
        self.skipped.contains(node_id)
    }
}

/// Evaluate one condition expression, falling back to `true` on any failure.
pub fn decide(expression: Option<&str>, inputs: &Map<String, Value>) -> Decision {
    let Some(source) = expression else {
        return Decision { taken: true, fallback_reason: Some("no expression configured".into()) };
    };
    match expression::evaluate(source, inputs) {
        Ok(taken) => Decision { taken, fallback_reason: None },
        Err(err) => {
            warn!(expression = source, error = %err, "condition fell back to the true branch");
            Decision { taken: true, fallback_reason: Some(err.to_string()) }
        }
    }
}

/// Resolve every condition node and collect the skipped node ids.
///
/// `order` must list every node of `graph` with predecessors first (as
/// returned by [`crate::dag::validate_graph`]); it only matters for
/// [`SkipPropagation::Transitive`].
pub fn resolve(
    graph: &FlowGraph,
    order: &[String],
    inputs: &Map<String, Value>,
    propagation: SkipPropagation,
) -> BranchResolution {
    let mut decisions = BTreeMap::new();
    for node in graph.nodes.iter().filter(|n| n.node_type == NodeType::Condition) {
        let decision = decide(node.condition_expression().as_deref(), inputs);
        debug!(node = %node.id, taken = decision.taken, "condition resolved");
        decisions.insert(node.id.clone(), decision);
    }

    let is_dead_branch = |edge: &FlowEdge| match (edge.branch, decisions.get(&edge.source)) {
        (Some(branch), Some(decision)) => branch.taken_when() != decision.taken,
        _ => false,
    };

    let mut incoming: HashMap<&str, Vec<&FlowEdge>> = HashMap::new();
    for edge in &graph.edges {
        incoming.entry(edge.target.as_str()).or_default().push(edge);
    }

    let mut skipped = BTreeSet::new();
    for node_id in order {
        let Some(edges) = incoming.get(node_id.as_str()) else {
            continue;
        };
        // A node stays live as long as one incoming edge can still carry flow.
        let all_dead = edges.iter().all(|edge| {
            is_dead_branch(edge)
                || (propagation == SkipPropagation::Transitive && skipped.contains(&edge.source))
        });
        if all_dead {
            skipped.insert(node_id.clone());
        }
    }

    BranchResolution { decisions, skipped }
}
