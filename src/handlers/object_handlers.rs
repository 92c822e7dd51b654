//! HTTP handlers for stored objects.

use crate::{errors::AppError, handlers::AppState, models::object::ObjectView};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// GET `/objects/{id}`: counts as an access.
pub async fn get_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ObjectView>, AppError> {
    Ok(Json(state.ledger.get_object(&id).await?))
}

/// DELETE `/objects/{id}`: refused with 409 while any flow references it.
pub async fn delete_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.ledger.delete_object(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
