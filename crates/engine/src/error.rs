//! Engine-level error types.

use thiserror::Error;

/// Errors produced by the flow store and the task engine.
///
/// `NotFound` and `InvalidState` describe caller misuse and are surfaced
/// verbatim; nothing in the engine retries them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A flow, flow version, task or step id does not resolve.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The operation is not allowed from the record's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    /// A stored row could not be mapped back onto a domain type.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

/// Rejections of malformed flows and trigger input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("flow name must not be empty")]
    EmptyFlowName,

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the flow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("flow graph contains a cycle")]
    CycleDetected,

    /// Branch tags are only meaningful on edges leaving a condition node.
    #[error("edge {source_id} -> {target} carries a branch tag but '{source_id}' is not a condition node")]
    BranchOnNonCondition { source_id: String, target: String },

    #[error("invalid trigger input: {0}")]
    InvalidInput(String),

    #[error("invalid paging: {0}")]
    InvalidPaging(String),
}
