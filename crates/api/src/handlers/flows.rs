use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use engine::models::{FlowDefinition, FlowDraft, FlowVersion};
use engine::planner::Preview;
use engine::{TaskInstance, TriggerRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Actor, OptionalJson};
use crate::{ApiError, AppState};

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<FlowDefinition>>, ApiError> {
    Ok(Json(state.flows.list().await?))
}

/// Create a flow, or add a version to the flow with the same name.
pub async fn create(
    State(state): State<AppState>,
    actor: Actor,
    Json(draft): Json<FlowDraft>,
) -> Result<(StatusCode, Json<FlowDefinition>), ApiError> {
    let flow = state.flows.save(&draft, &actor.0).await?;
    let status = if flow.version == 1 { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(flow)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<FlowDefinition>, ApiError> {
    Ok(Json(state.flows.get(id).await?))
}

pub async fn update(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
    Json(draft): Json<FlowDraft>,
) -> Result<Json<FlowDefinition>, ApiError> {
    Ok(Json(state.flows.update(id, &draft, &actor.0).await?))
}

pub async fn versions(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<FlowVersion>>, ApiError> {
    Ok(Json(state.flows.versions(id).await?))
}

pub async fn version(
    Path((id, version)): Path<(Uuid, i32)>,
    State(state): State<AppState>,
) -> Result<Json<FlowVersion>, ApiError> {
    Ok(Json(state.flows.version(id, version).await?))
}

#[derive(Debug, Deserialize)]
pub struct RollbackDto {
    pub version: i32,
}

pub async fn rollback(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<RollbackDto>,
) -> Result<Json<FlowDefinition>, ApiError> {
    Ok(Json(state.flows.rollback(id, payload.version, &actor.0).await?))
}

#[derive(Debug, Serialize)]
pub struct Triggered {
    pub task_id: Uuid,
    pub task: TaskInstance,
}

/// Instantiate a task. An empty body triggers with no input; a malformed
/// one is rejected before anything is created.
pub async fn trigger(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
    OptionalJson(request): OptionalJson<TriggerRequest>,
) -> Result<(StatusCode, Json<Triggered>), ApiError> {
    let task = state.executor.trigger(id, &request, &actor.0).await?;
    Ok((StatusCode::CREATED, Json(Triggered { task_id: task.id, task })))
}

#[derive(Debug, Default, Deserialize)]
pub struct PreviewDto {
    #[serde(default)]
    pub input: Value,
}

pub async fn preview(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    OptionalJson(payload): OptionalJson<PreviewDto>,
) -> Result<Json<Preview>, ApiError> {
    Ok(Json(state.executor.preview(id, &payload.input).await?))
}
