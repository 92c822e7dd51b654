//! HTTP handlers for the segments of a flow.
//!
//! Segment registration here is metadata only: payload bytes travel through
//! the presigned `/blobs` URLs handed out by `POST /flows/{id}/storage`.

use crate::{
    errors::AppError,
    handlers::{AppState, flow_handlers::outcome_response},
    models::{
        segment::{Segment, SegmentView},
        timerange::TimeRange,
    },
    services::{
        deletion_orchestrator::DeletionMode,
        error::CoreError,
        segment_store::{NewSegment, StorageAllocation},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct SegmentQuery {
    pub timerange: Option<String>,
    #[serde(default)]
    pub mode: DeletionMode,
    pub deleted_by: Option<String>,
}

impl SegmentQuery {
    fn parsed(&self) -> Result<Option<TimeRange>, AppError> {
        let range = self
            .timerange
            .as_deref()
            .map(TimeRange::parse)
            .transpose()
            .map_err(CoreError::from)?;
        Ok(range)
    }
}

#[derive(Debug, Deserialize)]
pub struct AllocateReq {
    pub limit: Option<u32>,
    pub timerange: String,
}

/// GET `/flows/{id}/segments?timerange=`
pub async fn list_segments(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Query(q): Query<SegmentQuery>,
) -> Result<Json<Vec<SegmentView>>, AppError> {
    let range = q.parsed()?;
    let segments = state.segments.list_segments(flow_id, range.as_ref()).await?;
    Ok(Json(segments))
}

/// POST `/flows/{id}/segments`
pub async fn create_segment(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Json(new): Json<NewSegment>,
) -> Result<(StatusCode, Json<Segment>), AppError> {
    let segment = state
        .segments
        .create_segment(flow_id, new, Bytes::new(), None)
        .await?;
    Ok((StatusCode::CREATED, Json(segment)))
}

/// DELETE `/flows/{id}/segments?timerange=&mode=`
pub async fn delete_segments(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Query(q): Query<SegmentQuery>,
) -> Result<Response, AppError> {
    let range = q.parsed()?;
    let outcome = state
        .orchestrator
        .delete_segments(flow_id, range.as_ref(), q.mode, q.deleted_by)
        .await?;
    Ok(outcome_response(outcome))
}

/// GET `/flows/{id}/segments/{segment_id}/payload`
pub async fn get_segment_payload(
    State(state): State<AppState>,
    Path((flow_id, segment_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, AppError> {
    let payload = state.segments.segment_payload(flow_id, segment_id).await?;
    let mut response = Response::new(Body::from(payload));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

/// POST `/flows/{id}/storage`
pub async fn allocate_storage(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    Json(req): Json<AllocateReq>,
) -> Result<(StatusCode, Json<Vec<StorageAllocation>>), AppError> {
    let range = TimeRange::parse(&req.timerange).map_err(CoreError::from)?;
    let allocations = state
        .segments
        .allocate_storage(flow_id, req.limit.unwrap_or(1), &range)
        .await?;
    Ok((StatusCode::CREATED, Json(allocations)))
}
