use axum::extract::{Path, State};
use axum::Json;
use engine::store::StepOutcome;
use engine::HumanStep;
use serde::Deserialize;
use uuid::Uuid;

use super::Actor;
use crate::{ApiError, AppState};

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<HumanStep>, ApiError> {
    Ok(Json(state.executor.step(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SubmitDto {
    pub content: String,
}

pub async fn submit(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<SubmitDto>,
) -> Result<Json<StepOutcome>, ApiError> {
    Ok(Json(state.executor.submit_step(id, &payload.content, &actor.0).await?))
}

#[derive(Debug, Deserialize)]
pub struct RejectDto {
    pub reason: String,
}

pub async fn reject(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<RejectDto>,
) -> Result<Json<StepOutcome>, ApiError> {
    Ok(Json(state.executor.reject_step(id, &payload.reason, &actor.0).await?))
}
