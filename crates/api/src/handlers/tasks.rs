use axum::extract::{Path, Query, State};
use axum::Json;
use engine::models::TaskDag;
use engine::store::{TaskPage, TaskQuery};
use engine::{HumanStep, TaskInstance, TaskStatus};
use serde::Deserialize;
use uuid::Uuid;

use super::{Actor, OptionalJson};
use crate::{ApiError, AppState};

/// Query string of `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Comma-separated statuses, e.g. `pending,running`.
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub search: Option<String>,
    /// `asc` or `desc` by creation time (default `desc`).
    pub sort: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListParams {
    pub fn into_query(self) -> Result<TaskQuery, ApiError> {
        let defaults = TaskQuery::default();
        let statuses = match self.status.as_deref() {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<TaskStatus>().map_err(ApiError::BadRequest))
                .collect::<Result<_, _>>()?,
        };
        let oldest_first = match self.sort.as_deref() {
            None | Some("desc") => false,
            Some("asc") => true,
            Some(other) => return Err(ApiError::BadRequest(format!("unknown sort order: {other}"))),
        };
        Ok(TaskQuery {
            statuses,
            assignee: self.assignee,
            search: self.search,
            oldest_first,
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
        })
    }
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<TaskPage>, ApiError> {
    let query = params.into_query()?;
    Ok(Json(state.executor.list_tasks(&query).await?))
}

/// The caller's pending and running tasks.
pub async fn mine(State(state): State<AppState>, actor: Actor) -> Result<Json<TaskPage>, ApiError> {
    Ok(Json(state.executor.my_tasks(&actor.0).await?))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<TaskInstance>, ApiError> {
    Ok(Json(state.executor.task(id).await?))
}

pub async fn dag(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<TaskDag>, ApiError> {
    Ok(Json(state.executor.task_dag(id).await?))
}

pub async fn steps(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<HumanStep>>, ApiError> {
    Ok(Json(state.executor.steps(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateDto {
    pub reason: Option<String>,
}

pub async fn terminate(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
    OptionalJson(payload): OptionalJson<TerminateDto>,
) -> Result<Json<TaskInstance>, ApiError> {
    Ok(Json(state.executor.terminate(id, payload.reason.as_deref(), &actor.0).await?))
}

pub async fn urge(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<TaskInstance>, ApiError> {
    Ok(Json(state.executor.urge(id, &actor.0).await?))
}
