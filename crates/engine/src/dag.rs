//! Flow graph validation: run this before persisting a flow version.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the flow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. Branch tags may only sit on edges leaving a condition node.
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of node IDs on success.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{FlowGraph, NodeType};
use crate::ValidationError;

/// Validate the flow graph and return its nodes in topological order.
///
/// Ties are broken by declaration order, so the result is deterministic.
///
/// # Errors
/// - [`ValidationError::DuplicateNodeId`] if two nodes share an ID.
/// - [`ValidationError::UnknownNodeReference`] if an edge references a missing node.
/// - [`ValidationError::BranchOnNonCondition`] for a tagged edge out of a non-condition node.
/// - [`ValidationError::CycleDetected`] if the graph is not acyclic.
pub fn validate_graph(graph: &FlowGraph) -> Result<Vec<String>, ValidationError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut types: HashMap<&str, NodeType> = HashMap::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        if types.insert(node.id.as_str(), node.node_type).is_some() {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints and branch tags
    // -----------------------------------------------------------------------
    for edge in &graph.edges {
        let Some(source_type) = types.get(edge.source.as_str()) else {
            return Err(ValidationError::UnknownNodeReference {
                node_id: edge.source.clone(),
                side: "source",
            });
        };
        if !types.contains_key(edge.target.as_str()) {
            return Err(ValidationError::UnknownNodeReference {
                node_id: edge.target.clone(),
                side: "target",
            });
        }
        if edge.branch.is_some() && *source_type != NodeType::Condition {
            return Err(ValidationError::BranchOnNonCondition {
                source_id: edge.source.clone(),
                target: edge.target.clone(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> =
        graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();

    for edge in &graph.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }

    // Seed the queue with root nodes, in declaration order.
    let mut queue: VecDeque<&str> = graph
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(graph.nodes.len());
    let mut visited: HashSet<&str> = HashSet::with_capacity(graph.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        sorted.push(node_id.to_owned());

        if let Some(neighbours) = adjacency.get(node_id) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != graph.nodes.len() {
        return Err(ValidationError::CycleDetected);
    }

    Ok(sorted)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Branch, FlowEdge, FlowNode};

    fn auto(id: &str) -> FlowNode {
        FlowNode::new(id, NodeType::Auto, id)
    }

    #[test]
    fn valid_linear_graph_returns_sorted_order() {
        // A → B → C
        let graph = FlowGraph::new(
            vec![auto("a"), auto("b"), auto("c")],
            vec![FlowEdge::new("a", "b"), FlowEdge::new("b", "c")],
        );

        let sorted = validate_graph(&graph).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn declaration_order_is_not_required_to_be_topological() {
        let graph = FlowGraph::new(
            vec![auto("review"), auto("collect")],
            vec![FlowEdge::new("collect", "review")],
        );
        assert_eq!(validate_graph(&graph).unwrap(), vec!["collect", "review"]);
    }

    #[test]
    fn valid_diamond_graph() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let graph = FlowGraph::new(
            vec![auto("a"), auto("b"), auto("c"), auto("d")],
            vec![
                FlowEdge::new("a", "b"),
                FlowEdge::new("a", "c"),
                FlowEdge::new("b", "d"),
                FlowEdge::new("c", "d"),
            ],
        );

        let sorted = validate_graph(&graph).expect("should be valid");
        assert_eq!(sorted, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let graph = FlowGraph::new(vec![auto("a"), auto("a")], vec![]);
        assert!(matches!(
            validate_graph(&graph),
            Err(ValidationError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let graph = FlowGraph::new(vec![auto("a")], vec![FlowEdge::new("a", "ghost")]);
        assert!(matches!(
            validate_graph(&graph),
            Err(ValidationError::UnknownNodeReference { node_id, side: "target" }) if node_id == "ghost"
        ));
    }

    #[test]
    fn branch_tag_outside_condition_is_rejected() {
        let graph = FlowGraph::new(
            vec![auto("a"), auto("b")],
            vec![FlowEdge::new("a", "b").on(Branch::True)],
        );
        assert!(matches!(
            validate_graph(&graph),
            Err(ValidationError::BranchOnNonCondition { .. })
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // A → B → C → A
        let graph = FlowGraph::new(
            vec![auto("a"), auto("b"), auto("c")],
            vec![
                FlowEdge::new("a", "b"),
                FlowEdge::new("b", "c"),
                FlowEdge::new("c", "a"),
            ],
        );
        assert_eq!(validate_graph(&graph), Err(ValidationError::CycleDetected));
    }

    #[test]
    fn empty_graph_is_valid() {
        assert_eq!(validate_graph(&FlowGraph::default()).unwrap(), Vec::<String>::new());
    }
}
