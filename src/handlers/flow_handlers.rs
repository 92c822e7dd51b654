//! HTTP handlers for sources and flows.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::flow::{Flow, Source},
    services::{
        deletion_orchestrator::{DeletionMode, DeletionOutcome},
        flow_registry::{NewFlow, NewSource},
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub cascade: bool,
    #[serde(default)]
    pub mode: DeletionMode,
    pub deleted_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadOnlyReq {
    pub read_only: bool,
}

/// POST `/sources`
pub async fn create_source(
    State(state): State<AppState>,
    Json(new): Json<NewSource>,
) -> Result<(StatusCode, Json<Source>), AppError> {
    let source = state.flows.create_source(new).await?;
    Ok((StatusCode::CREATED, Json(source)))
}

/// GET `/sources/{id}`
pub async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Source>, AppError> {
    Ok(Json(state.flows.get_source(id).await?))
}

/// DELETE `/sources/{id}`: sources are immutable, so this always fails.
pub async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<DeleteQuery>,
) -> Result<StatusCode, AppError> {
    state.orchestrator.delete_source(id, q.cascade)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/flows`
pub async fn create_flow(
    State(state): State<AppState>,
    Json(new): Json<NewFlow>,
) -> Result<(StatusCode, Json<Flow>), AppError> {
    let flow = state.flows.create_flow(new).await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

/// GET `/flows/{id}`
pub async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Flow>, AppError> {
    Ok(Json(state.flows.get_flow(id).await?))
}

/// PUT `/flows/{id}/read_only`
pub async fn set_read_only(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReadOnlyReq>,
) -> Result<Json<Flow>, AppError> {
    Ok(Json(state.flows.set_read_only(id, req.read_only).await?))
}

/// DELETE `/flows/{id}?cascade=&mode=&deleted_by=`
pub async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<DeleteQuery>,
) -> Result<Response, AppError> {
    let outcome = state
        .orchestrator
        .delete_flow(id, q.cascade, q.mode, q.deleted_by)
        .await?;
    Ok(outcome_response(outcome))
}

/// 200 with the removal count for inline deletions, 202 with the recorded
/// request for queued ones.
pub(crate) fn outcome_response(outcome: DeletionOutcome) -> Response {
    let status = match outcome {
        DeletionOutcome::Deleted { .. } => StatusCode::OK,
        DeletionOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    (status, Json(outcome)).into_response()
}
