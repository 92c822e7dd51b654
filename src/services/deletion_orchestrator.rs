//! src/services/deletion_orchestrator.rs
//!
//! DeletionOrchestrator: decides how flow and segment deletions run.
//!
//! A deletion first counts the segments it would remove. At or below the
//! configured threshold it runs inline in the calling request; above it the
//! work is recorded as a pending [`DeletionRequest`] and handed to the
//! deletion worker, unless the caller insisted on a synchronous delete.
//! Sources can never be deleted.

use crate::{
    config::DeletionThreshold,
    models::{
        deletion::{DeletionRequest, DeletionStatus},
        timerange::TimeRange,
    },
    services::{
        error::{CoreError, CoreResult},
        flow_registry::FlowRegistry,
        segment_store::SegmentStore,
    },
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite, SqlitePool};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

const REQUEST_COLUMNS: &str =
    "id, flow_id, timerange, delete_flow, status, deleted_by, error, created, updated";

/// How a caller wants a deletion above the threshold handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionMode {
    /// Inline when small enough, queued otherwise.
    #[default]
    Auto,
    /// Inline only; refused with `TooManyDependents` above the threshold.
    Sync,
    /// Inline regardless of size. The caller accepts the request latency.
    Force,
}

/// What a flow deletion would have to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dependents {
    pub segment_count: i64,
    pub has_dependencies: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeletionOutcome {
    /// Everything was removed before returning.
    Deleted { segments_removed: u64 },
    /// A deletion request was recorded for the worker.
    Queued { request: DeletionRequest },
}

#[derive(Clone)]
pub struct DeletionOrchestrator {
    pub db: Arc<SqlitePool>,
    segments: SegmentStore,
    flows: FlowRegistry,
    threshold: DeletionThreshold,
    queue: UnboundedSender<Uuid>,
}

impl DeletionOrchestrator {
    pub fn new(
        db: Arc<SqlitePool>,
        segments: SegmentStore,
        flows: FlowRegistry,
        threshold: DeletionThreshold,
        queue: UnboundedSender<Uuid>,
    ) -> Self {
        Self {
            db,
            segments,
            flows,
            threshold,
            queue,
        }
    }

    pub fn threshold(&self) -> &DeletionThreshold {
        &self.threshold
    }

    /// Count a flow's segments without loading them.
    pub async fn evaluate(&self, flow_id: Uuid) -> CoreResult<Dependents> {
        self.flows.get_flow(flow_id).await?;
        let segment_count = self.segments.count_segments(flow_id).await?;
        Ok(Dependents {
            segment_count,
            has_dependencies: segment_count > 0,
        })
    }

    /// Delete a flow, cascading to its segments when `cascade` is set.
    ///
    /// Without `cascade` a flow that still has segments is refused outright.
    /// With it, segments go first (releasing object references, never
    /// deleting objects) and the flow row last.
    pub async fn delete_flow(
        &self,
        flow_id: Uuid,
        cascade: bool,
        mode: DeletionMode,
        deleted_by: Option<String>,
    ) -> CoreResult<DeletionOutcome> {
        self.flows.writable_flow(flow_id).await?;
        let dependents = self.evaluate(flow_id).await?;

        if dependents.has_dependencies && !cascade {
            return Err(CoreError::DependentsExist {
                kind: "flow",
                id: flow_id,
                count: dependents.segment_count,
            });
        }

        if self.should_queue(flow_id, dependents.segment_count, mode)? {
            let request = self
                .enqueue(flow_id, &TimeRange::eternity(), true, deleted_by)
                .await?;
            return Ok(DeletionOutcome::Queued { request });
        }

        let segments_removed = if dependents.has_dependencies {
            self.segments.delete_segments(flow_id, None).await?
        } else {
            0
        };
        self.flows.remove_flow_row(flow_id).await?;

        info!(%flow_id, segments_removed, deleted_by = ?deleted_by, "deleted flow");
        Ok(DeletionOutcome::Deleted { segments_removed })
    }

    /// Delete the segments of a flow overlapping `timerange`.
    pub async fn delete_segments(
        &self,
        flow_id: Uuid,
        timerange: Option<&TimeRange>,
        mode: DeletionMode,
        deleted_by: Option<String>,
    ) -> CoreResult<DeletionOutcome> {
        self.flows.writable_flow(flow_id).await?;
        let count = self.segments.count_matching(flow_id, timerange).await?;

        if self.should_queue(flow_id, count, mode)? {
            let range = timerange.copied().unwrap_or_else(TimeRange::eternity);
            let request = self.enqueue(flow_id, &range, false, deleted_by).await?;
            return Ok(DeletionOutcome::Queued { request });
        }

        let segments_removed = self.segments.delete_segments(flow_id, timerange).await?;
        Ok(DeletionOutcome::Deleted { segments_removed })
    }

    /// Sources are immutable: this always fails, whatever the flags.
    pub fn delete_source(&self, source_id: Uuid, cascade: bool) -> CoreResult<()> {
        warn!(%source_id, cascade, "refusing to delete source");
        Err(CoreError::SourcesAreImmutable)
    }

    pub async fn get_deletion_request(&self, request_id: Uuid) -> CoreResult<DeletionRequest> {
        fetch_request(&*self.db, request_id)
            .await?
            .ok_or_else(|| CoreError::not_found("deletion request", request_id))
    }

    pub async fn list_deletion_requests(&self) -> CoreResult<Vec<DeletionRequest>> {
        let requests = sqlx::query_as::<_, DeletionRequest>(&format!(
            "SELECT {} FROM deletion_requests ORDER BY created DESC",
            REQUEST_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(requests)
    }

    /// `true` when `count` segments must be deleted out of band.
    fn should_queue(&self, flow_id: Uuid, count: i64, mode: DeletionMode) -> CoreResult<bool> {
        let threshold = self.threshold.get();
        if count <= 0 || (count as u64) <= threshold {
            return Ok(false);
        }

        match mode {
            DeletionMode::Auto => Ok(true),
            DeletionMode::Sync => Err(CoreError::TooManyDependents {
                flow_id,
                count,
                threshold,
            }),
            DeletionMode::Force => {
                warn!(%flow_id, count, threshold, "forcing synchronous deletion above threshold");
                Ok(false)
            }
        }
    }

    async fn enqueue(
        &self,
        flow_id: Uuid,
        timerange: &TimeRange,
        delete_flow: bool,
        deleted_by: Option<String>,
    ) -> CoreResult<DeletionRequest> {
        let now = Utc::now();
        let request = DeletionRequest {
            id: Uuid::new_v4(),
            flow_id,
            timerange: timerange.to_string(),
            delete_flow,
            status: DeletionStatus::Pending,
            deleted_by,
            error: None,
            created: now,
            updated: now,
        };

        sqlx::query(
            "INSERT INTO deletion_requests (
                id, flow_id, timerange, delete_flow, status, deleted_by, error, created, updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id)
        .bind(request.flow_id)
        .bind(&request.timerange)
        .bind(request.delete_flow)
        .bind(request.status)
        .bind(&request.deleted_by)
        .bind(&request.error)
        .bind(request.created)
        .bind(request.updated)
        .execute(&*self.db)
        .await?;

        if self.queue.send(request.id).is_err() {
            warn!(
                request_id = %request.id,
                "deletion worker is gone; request left for reconciliation"
            );
        }

        info!(
            request_id = %request.id,
            %flow_id,
            timerange = %request.timerange,
            delete_flow,
            "queued deletion request"
        );
        Ok(request)
    }
}

pub(crate) async fn fetch_request<'e, E>(
    executor: E,
    request_id: Uuid,
) -> Result<Option<DeletionRequest>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, DeletionRequest>(&format!(
        "SELECT {} FROM deletion_requests WHERE id = ?",
        REQUEST_COLUMNS
    ))
    .bind(request_id)
    .fetch_optional(executor)
    .await
}
