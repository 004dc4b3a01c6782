//! `engine` crate: flow definitions, branch resolution, task instantiation
//! and the human-step lifecycle.

pub mod condition;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod flows;
pub mod models;
pub mod planner;
pub mod rollup;
pub mod sinks;
pub mod store;
pub mod template;

pub use config::ExecutorConfig;
pub use dag::validate_graph;
pub use error::{EngineError, ValidationError};
pub use executor::TaskExecutor;
pub use flows::FlowService;
pub use models::{FlowDefinition, FlowDraft, FlowGraph, HumanStep, TaskInstance, TaskStatus};
pub use planner::{TriggerOrigin, TriggerRequest};
pub use sinks::Sinks;
pub use store::{MemoryStore, PgStore, Store};

#[cfg(test)]
mod executor_tests;
