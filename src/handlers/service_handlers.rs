//! Deletion request inspection and service-level settings.

use crate::{errors::AppError, handlers::AppState, models::deletion::DeletionRequest};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdBody {
    pub threshold: u64,
}

/// GET `/flow-delete-requests`
pub async fn list_deletion_requests(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeletionRequest>>, AppError> {
    Ok(Json(state.orchestrator.list_deletion_requests().await?))
}

/// GET `/flow-delete-requests/{id}`
pub async fn get_deletion_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeletionRequest>, AppError> {
    Ok(Json(state.orchestrator.get_deletion_request(id).await?))
}

/// GET `/service/deletion-threshold`
pub async fn get_threshold(State(state): State<AppState>) -> Json<ThresholdBody> {
    Json(ThresholdBody {
        threshold: state.orchestrator.threshold().get(),
    })
}

/// PUT `/service/deletion-threshold`: applies to deletions started afterwards.
pub async fn set_threshold(
    State(state): State<AppState>,
    Json(body): Json<ThresholdBody>,
) -> Json<ThresholdBody> {
    state.orchestrator.threshold().set(body.threshold);
    tracing::info!(threshold = body.threshold, "updated deletion threshold");
    Json(body)
}
