//! Persistence seam for flows and tasks.
//!
//! A [`Store`] owns the two critical sections of the engine: bumping a
//! flow's version counter and the resolve-then-roll-up sequence on a task.
//! Both must run as one atomic read-modify-write per flow or per task.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    DagExecutionNode, FlowDefinition, FlowDraft, FlowVersion, HumanStep, TaskInstance, TaskStatus,
};
use crate::planner::TaskPlan;
use crate::rollup::StepResolution;
use crate::{EngineError, ValidationError};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const MAX_PAGE_SIZE: u32 = 100;

/// Filter and paging for task listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQuery {
    /// Empty means any status.
    pub statuses: Vec<TaskStatus>,
    pub assignee: Option<String>,
    /// Case-insensitive substring of the title or flow name.
    pub search: Option<String>,
    pub oldest_first: bool,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            assignee: None,
            search: None,
            oldest_first: false,
            page: 1,
            page_size: 20,
        }
    }
}

impl TaskQuery {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.page == 0 {
            return Err(ValidationError::InvalidPaging("page starts at 1".into()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ValidationError::InvalidPaging(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Trimmed, non-empty search term.
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub items: Vec<TaskInstance>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl TaskPage {
    pub fn new(items: Vec<TaskInstance>, total: u64, query: &TaskQuery) -> Self {
        let size = u64::from(query.page_size.max(1));
        Self {
            items,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total.div_ceil(size),
        }
    }
}

/// Result of closing one human step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: HumanStep,
    /// The owning task after roll-up.
    pub task: TaskInstance,
    /// This resolution moved the task into a terminal status.
    pub finalized: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create the flow called `draft.name` at version 1, or append a new
    /// version to the existing flow of that name.
    async fn save_flow(&self, draft: &FlowDraft, now: DateTime<Utc>) -> Result<FlowDefinition, EngineError>;

    /// Append a new version to flow `id`, renaming it if the draft says so.
    async fn update_flow(
        &self,
        id: Uuid,
        draft: &FlowDraft,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError>;

    /// Copy version `version`'s graph into a brand-new head version.
    async fn rollback_flow(
        &self,
        id: Uuid,
        version: i32,
        now: DateTime<Utc>,
    ) -> Result<FlowDefinition, EngineError>;

    async fn get_flow(&self, id: Uuid) -> Result<FlowDefinition, EngineError>;

    /// Newest first.
    async fn list_flows(&self) -> Result<Vec<FlowDefinition>, EngineError>;

    /// Ascending by version number.
    async fn list_versions(&self, flow_id: Uuid) -> Result<Vec<FlowVersion>, EngineError>;

    async fn get_version(&self, flow_id: Uuid, version: i32) -> Result<FlowVersion, EngineError>;

    /// Persist every record of a planned task in one unit.
    async fn insert_task(&self, plan: &TaskPlan) -> Result<TaskInstance, EngineError>;

    async fn get_task(&self, id: Uuid) -> Result<TaskInstance, EngineError>;

    async fn list_tasks(&self, query: &TaskQuery) -> Result<TaskPage, EngineError>;

    /// Execution nodes of a task in declaration order.
    async fn task_nodes(&self, task_id: Uuid) -> Result<Vec<DagExecutionNode>, EngineError>;

    /// Human steps of a task in declaration order.
    async fn task_steps(&self, task_id: Uuid) -> Result<Vec<HumanStep>, EngineError>;

    async fn get_step(&self, id: Uuid) -> Result<HumanStep, EngineError>;

    /// Close a pending step and roll its task up, atomically per task.
    async fn resolve_step(
        &self,
        step_id: Uuid,
        resolution: &StepResolution,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, EngineError>;

    /// Force a live task into `failed`.
    async fn terminate_task(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_bounds_are_enforced() {
        assert!(TaskQuery::default().validate().is_ok());
        assert!(TaskQuery { page: 0, ..TaskQuery::default() }.validate().is_err());
        assert!(TaskQuery { page_size: 101, ..TaskQuery::default() }.validate().is_err());
        assert!(TaskQuery { page_size: 0, ..TaskQuery::default() }.validate().is_err());
    }

    #[test]
    fn page_math() {
        let q = TaskQuery { page: 3, page_size: 10, ..TaskQuery::default() };
        assert_eq!(q.offset(), 20);
        assert_eq!(TaskPage::new(vec![], 21, &q).total_pages, 3);
        assert_eq!(TaskPage::new(vec![], 0, &q).total_pages, 0);
    }

    #[test]
    fn blank_search_is_ignored() {
        let q = TaskQuery { search: Some("  ".into()), ..TaskQuery::default() };
        assert_eq!(q.search_term(), None);
    }
}
