//! Background execution of queued deletion requests.
//!
//! The worker drains request ids from an mpsc queue and drives each request
//! `pending -> in_progress -> completed | failed`. Every step it takes is
//! idempotent, so a request left `in_progress` by a crash is simply run
//! again; [`reconcile`] re-enqueues such requests at startup.

use crate::{
    models::{
        deletion::{DeletionRequest, DeletionStatus},
        timerange::TimeRange,
    },
    services::{
        deletion_orchestrator::fetch_request,
        error::{CoreError, CoreResult},
        flow_registry::FlowRegistry,
        segment_store::SegmentStore,
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queue connecting the orchestrator to the worker.
pub fn deletion_queue() -> (UnboundedSender<Uuid>, UnboundedReceiver<Uuid>) {
    mpsc::unbounded_channel()
}

pub struct DeletionWorker {
    db: Arc<SqlitePool>,
    segments: SegmentStore,
    flows: FlowRegistry,
    queue: UnboundedReceiver<Uuid>,
}

impl DeletionWorker {
    pub fn new(
        db: Arc<SqlitePool>,
        segments: SegmentStore,
        flows: FlowRegistry,
        queue: UnboundedReceiver<Uuid>,
    ) -> Self {
        Self {
            db,
            segments,
            flows,
            queue,
        }
    }

    /// Process requests until every sender is dropped.
    pub async fn run(mut self) {
        info!("deletion worker started");
        while let Some(request_id) = self.queue.recv().await {
            if let Err(err) = self.process(request_id).await {
                error!(%request_id, error = %err, "could not process deletion request");
            }
        }
        info!("deletion queue closed; worker stopping");
    }

    /// Run one request to a terminal status.
    ///
    /// Requests already `completed` or `failed` are left alone. The returned
    /// status is the one stored afterwards; an `Err` means the status itself
    /// could not be recorded.
    pub async fn process(&self, request_id: Uuid) -> CoreResult<DeletionStatus> {
        let claimed = sqlx::query(
            "UPDATE deletion_requests SET status = ?, updated = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(DeletionStatus::InProgress)
        .bind(Utc::now())
        .bind(request_id)
        .bind(DeletionStatus::Pending)
        .bind(DeletionStatus::InProgress)
        .execute(&*self.db)
        .await?;

        let request = fetch_request(&*self.db, request_id)
            .await?
            .ok_or_else(|| CoreError::not_found("deletion request", request_id))?;
        if claimed.rows_affected() == 0 {
            debug!(%request_id, status = ?request.status, "deletion request already finished");
            return Ok(request.status);
        }

        match self.execute(&request).await {
            Ok(removed) => {
                self.finish(request_id, DeletionStatus::Completed, None).await?;
                info!(
                    %request_id,
                    flow_id = %request.flow_id,
                    removed,
                    "deletion request completed"
                );
                Ok(DeletionStatus::Completed)
            }
            Err(err) => {
                warn!(
                    %request_id,
                    flow_id = %request.flow_id,
                    error = %err,
                    "deletion request failed"
                );
                self.finish(request_id, DeletionStatus::Failed, Some(err.to_string()))
                    .await?;
                Ok(DeletionStatus::Failed)
            }
        }
    }

    async fn execute(&self, request: &DeletionRequest) -> CoreResult<u64> {
        let range = TimeRange::parse(&request.timerange)?;
        let query = (range != TimeRange::eternity()).then_some(range);

        let removed = match self.segments.delete_segments(request.flow_id, query.as_ref()).await {
            Ok(removed) => removed,
            // A resumed whole-flow request may find its flow already gone.
            Err(CoreError::NotFound { kind: "flow", .. }) if request.delete_flow => return Ok(0),
            Err(err) => return Err(err),
        };

        if request.delete_flow {
            self.flows.remove_flow_row(request.flow_id).await?;
        }
        Ok(removed)
    }

    async fn finish(
        &self,
        request_id: Uuid,
        status: DeletionStatus,
        error: Option<String>,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE deletion_requests SET status = ?, error = ?, updated = ? WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(Utc::now())
            .bind(request_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// Re-enqueue every request that never reached a terminal status.
pub async fn reconcile(db: &SqlitePool, queue: &UnboundedSender<Uuid>) -> CoreResult<usize> {
    let unfinished = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM deletion_requests WHERE status IN (?, ?) ORDER BY created",
    )
    .bind(DeletionStatus::Pending)
    .bind(DeletionStatus::InProgress)
    .fetch_all(db)
    .await?;

    for request_id in &unfinished {
        if queue.send(*request_id).is_err() {
            warn!(%request_id, "deletion worker is gone; stopping reconciliation");
            break;
        }
    }

    if !unfinished.is_empty() {
        info!(count = unfinished.len(), "re-enqueued unfinished deletion requests");
    }
    Ok(unfinished.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DeletionThreshold,
        services::{
            deletion_orchestrator::{DeletionMode, DeletionOrchestrator, DeletionOutcome},
            segment_store::tests::Fixture,
        },
    };

    struct Harness {
        fx: Fixture,
        orchestrator: DeletionOrchestrator,
        worker: DeletionWorker,
        tx: UnboundedSender<Uuid>,
    }

    async fn harness(threshold: u64) -> Harness {
        let fx = Fixture::new().await;
        let (tx, rx) = deletion_queue();
        let orchestrator = DeletionOrchestrator::new(
            fx.segments.db.clone(),
            fx.segments.clone(),
            fx.flows.clone(),
            DeletionThreshold::new(threshold),
            tx.clone(),
        );
        let worker = DeletionWorker::new(
            fx.segments.db.clone(),
            fx.segments.clone(),
            fx.flows.clone(),
            rx,
        );
        Harness {
            fx,
            orchestrator,
            worker,
            tx,
        }
    }

    async fn queued_flow_deletion(h: &Harness, segments: i64) -> (Uuid, DeletionRequest) {
        let flow = h.fx.flow().await;
        for i in 0..segments {
            h.fx.segment(flow, &format!("{}-{}", flow, i), i).await;
        }
        let outcome = h
            .orchestrator
            .delete_flow(flow, true, DeletionMode::Auto, None)
            .await
            .unwrap();
        let DeletionOutcome::Queued { request } = outcome else {
            panic!("expected a queued deletion");
        };
        (flow, request)
    }

    #[tokio::test]
    async fn completes_queued_flow_deletion() {
        let mut h = harness(1).await;
        let (flow, request) = queued_flow_deletion(&h, 3).await;
        let queued = h.worker.queue.recv().await.unwrap();
        assert_eq!(queued, request.id);

        assert_eq!(
            h.worker.process(queued).await.unwrap(),
            DeletionStatus::Completed
        );
        let stored = h.orchestrator.get_deletion_request(request.id).await.unwrap();
        assert_eq!(stored.status, DeletionStatus::Completed);
        assert!(stored.error.is_none());
        assert!(h.fx.flows.get_flow(flow).await.is_err());
        assert!(h.fx.ledger.can_delete(&format!("{}-0", flow)).await.unwrap());

        // finished requests are not run again
        assert_eq!(
            h.worker.process(request.id).await.unwrap(),
            DeletionStatus::Completed
        );
    }

    #[tokio::test]
    async fn failure_is_recorded_and_flow_kept() {
        let h = harness(1).await;
        let (flow, request) = queued_flow_deletion(&h, 2).await;
        h.fx.flows.set_read_only(flow, true).await.unwrap();

        assert_eq!(
            h.worker.process(request.id).await.unwrap(),
            DeletionStatus::Failed
        );
        let stored = h.orchestrator.get_deletion_request(request.id).await.unwrap();
        assert_eq!(stored.status, DeletionStatus::Failed);
        assert!(stored.error.unwrap().contains("read-only"));
        assert_eq!(h.fx.segments.count_segments(flow).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn interrupted_request_resumes() {
        let h = harness(1).await;
        let (flow, request) = queued_flow_deletion(&h, 3).await;

        // simulate a worker that died after removing part of the flow
        sqlx::query("UPDATE deletion_requests SET status = ? WHERE id = ?")
            .bind(DeletionStatus::InProgress)
            .bind(request.id)
            .execute(&*h.fx.segments.db)
            .await
            .unwrap();
        let first = TimeRange::parse("[0:0_1:0)").unwrap();
        h.fx.segments.delete_segments(flow, Some(&first)).await.unwrap();

        assert_eq!(
            h.worker.process(request.id).await.unwrap(),
            DeletionStatus::Completed
        );
        assert!(h.fx.flows.get_flow(flow).await.is_err());
        assert_eq!(h.fx.segments.count_segments(flow).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resumed_request_tolerates_missing_flow() {
        let h = harness(1).await;
        let (flow, request) = queued_flow_deletion(&h, 2).await;
        h.fx.segments.delete_segments(flow, None).await.unwrap();
        h.fx.flows.remove_flow_row(flow).await.unwrap();

        assert_eq!(
            h.worker.process(request.id).await.unwrap(),
            DeletionStatus::Completed
        );
    }

    #[tokio::test]
    async fn reconcile_requeues_unfinished_requests() {
        let mut h = harness(1).await;
        let (_, first) = queued_flow_deletion(&h, 2).await;
        let (_, second) = queued_flow_deletion(&h, 2).await;
        while h.worker.queue.try_recv().is_ok() {}

        h.worker.process(first.id).await.unwrap();
        let requeued = reconcile(&h.fx.segments.db, &h.tx).await.unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(h.worker.queue.try_recv().unwrap(), second.id);
    }

    #[tokio::test]
    async fn run_drains_queue_until_closed() {
        let h = harness(1).await;
        let (flow, request) = queued_flow_deletion(&h, 2).await;
        let Harness {
            fx,
            orchestrator,
            worker,
            tx,
        } = h;
        drop(tx);
        drop(orchestrator);

        worker.run().await;
        assert!(fx.flows.get_flow(flow).await.is_err());
        let stored = fetch_request(&*fx.segments.db, request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeletionStatus::Completed);
    }
}
