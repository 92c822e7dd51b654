pub mod blob_handlers;
pub mod flow_handlers;
pub mod object_handlers;
pub mod segment_handlers;
pub mod service_handlers;

use crate::{
    config::DeletionThreshold,
    services::{
        blob_store::{BlobStore, LocalBlobStore},
        deletion_orchestrator::DeletionOrchestrator,
        flow_registry::FlowRegistry,
        object_ledger::ObjectLedger,
        segment_store::SegmentStore,
    },
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub flows: FlowRegistry,
    pub segments: SegmentStore,
    pub ledger: ObjectLedger,
    pub orchestrator: DeletionOrchestrator,

    /// Concrete store, for the streaming `/blobs` routes.
    pub blobs: Arc<LocalBlobStore>,
}

impl AppState {
    /// Wire up the core services over one pool and one blob store.
    pub fn new(
        db: Arc<SqlitePool>,
        blobs: Arc<LocalBlobStore>,
        url_ttl: Duration,
        threshold: DeletionThreshold,
        queue: UnboundedSender<Uuid>,
    ) -> Self {
        let blob_store: Arc<dyn BlobStore> = blobs.clone();
        let flows = FlowRegistry::new(db.clone());
        let ledger = ObjectLedger::new(db.clone(), blob_store.clone());
        let segments = SegmentStore::new(
            db.clone(),
            blob_store,
            ledger.clone(),
            flows.clone(),
            url_ttl,
        );
        let orchestrator =
            DeletionOrchestrator::new(db, segments.clone(), flows.clone(), threshold, queue);

        Self {
            flows,
            segments,
            ledger,
            orchestrator,
            blobs,
        }
    }
}
