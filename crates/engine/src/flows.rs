//! Flow definition store: validated saves, version history and rollback.

use std::sync::Arc;

use chrono::Utc;
use notify::AuditEntry;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::dag::validate_graph;
use crate::models::{FlowDefinition, FlowDraft, FlowVersion};
use crate::sinks::Sinks;
use crate::store::Store;
use crate::{EngineError, ValidationError};

pub struct FlowService {
    store: Arc<dyn Store>,
    sinks: Sinks,
}

impl FlowService {
    pub fn new(store: Arc<dyn Store>, sinks: Sinks) -> Self {
        Self { store, sinks }
    }

    /// Reject drafts that could never be instantiated.
    fn check(draft: &FlowDraft) -> Result<FlowDraft, ValidationError> {
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyFlowName);
        }
        validate_graph(&draft.graph)?;
        Ok(FlowDraft { name: name.to_owned(), ..draft.clone() })
    }

    /// Create the flow named in `draft`, or append a version to the flow
    /// that already carries that name.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn save(&self, draft: &FlowDraft, actor: &str) -> Result<FlowDefinition, EngineError> {
        let draft = Self::check(draft)?;
        let flow = self.store.save_flow(&draft, Utc::now()).await?;
        info!(flow_id = %flow.id, version = flow.version, "flow saved");
        self.sinks.audit(AuditEntry::now(actor, "flow_saved", format!("{} v{}", flow.name, flow.version)));
        Ok(flow)
    }

    /// Append a version to flow `id`, renaming it if the draft says so.
    #[instrument(skip(self, draft))]
    pub async fn update(&self, id: Uuid, draft: &FlowDraft, actor: &str) -> Result<FlowDefinition, EngineError> {
        let draft = Self::check(draft)?;
        let flow = self.store.update_flow(id, &draft, Utc::now()).await?;
        info!(version = flow.version, "flow updated");
        self.sinks.audit(AuditEntry::now(actor, "flow_saved", format!("{} v{}", flow.name, flow.version)));
        Ok(flow)
    }

    pub async fn get(&self, id: Uuid) -> Result<FlowDefinition, EngineError> {
        self.store.get_flow(id).await
    }

    pub async fn list(&self) -> Result<Vec<FlowDefinition>, EngineError> {
        self.store.list_flows().await
    }

    pub async fn versions(&self, id: Uuid) -> Result<Vec<FlowVersion>, EngineError> {
        self.store.list_versions(id).await
    }

    pub async fn version(&self, id: Uuid, version: i32) -> Result<FlowVersion, EngineError> {
        self.store.get_version(id, version).await
    }

    /// Copy an old version's graph into a new head version. History is
    /// never rewritten.
    #[instrument(skip(self))]
    pub async fn rollback(&self, id: Uuid, version: i32, actor: &str) -> Result<FlowDefinition, EngineError> {
        let flow = self.store.rollback_flow(id, version, Utc::now()).await?;
        info!(from = version, to = flow.version, "flow rolled back");
        self.sinks.audit(AuditEntry::now(
            actor,
            "flow_rollback",
            format!("{} v{} -> v{}", flow.name, version, flow.version),
        ));
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowEdge, FlowGraph, FlowNode, NodeType};
    use crate::store::MemoryStore;
    use notify::memory::MemorySink;
    use std::time::Duration;

    fn service() -> (FlowService, Sinks, MemorySink) {
        let sink = MemorySink::new();
        let sinks = Sinks::new(Arc::new(sink.clone()), Arc::new(sink.clone()), Duration::from_secs(1));
        (FlowService::new(Arc::new(MemoryStore::new()), sinks.clone()), sinks, sink)
    }

    fn graph(ids: &[&str]) -> FlowGraph {
        let nodes = ids.iter().map(|id| FlowNode::new(*id, NodeType::Auto, *id)).collect();
        let edges = ids.windows(2).map(|w| FlowEdge::new(w[0], w[1])).collect();
        FlowGraph::new(nodes, edges)
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let (flows, _, _) = service();
        let err = flows.save(&FlowDraft::new("  ", graph(&["a"])), "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::EmptyFlowName)));
    }

    #[tokio::test]
    async fn edge_to_unknown_node_is_rejected() {
        let (flows, _, _) = service();
        let mut g = graph(&["a"]);
        g.edges.push(FlowEdge::new("a", "ghost"));
        let err = flows.save(&FlowDraft::new("f", g), "alice").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownNodeReference { .. })
        ));
    }

    #[tokio::test]
    async fn every_save_and_rollback_bumps_version_by_one() {
        let (flows, sinks, sink) = service();
        let first = flows.save(&FlowDraft::new("f", graph(&["a"])), "alice").await.unwrap();
        assert_eq!(first.version, 1);

        let mut last = first.version;
        for n in 0..4 {
            let next = if n % 2 == 0 {
                flows.save(&FlowDraft::new("f", graph(&["a", "b"])), "alice").await.unwrap()
            } else {
                flows.rollback(first.id, 1, "alice").await.unwrap()
            };
            assert_eq!(next.version, last + 1);
            last = next.version;
        }
        assert_eq!(last, 1 + 4);
        assert_eq!(flows.versions(first.id).await.unwrap().len(), 5);
        sinks.flush().await;
        assert_eq!(sink.audit_entries().len(), 5);
    }

    #[tokio::test]
    async fn names_are_trimmed_before_lookup() {
        let (flows, _, _) = service();
        let a = flows.save(&FlowDraft::new("采购", graph(&["a"])), "alice").await.unwrap();
        let b = flows.save(&FlowDraft::new(" 采购 ", graph(&["a"])), "alice").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.version, 2);
    }
}
