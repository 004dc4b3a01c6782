use std::sync::Arc;

use engine::{FlowService, TaskExecutor};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub flows: Arc<FlowService>,
    pub executor: Arc<TaskExecutor>,
}

impl AppState {
    pub fn new(flows: FlowService, executor: TaskExecutor) -> Self {
        Self { flows: Arc::new(flows), executor: Arc::new(executor) }
    }
}
