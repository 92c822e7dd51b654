//! src/services/segment_store.rs
//!
//! SegmentStore: creates, lists and deletes segment metadata rows and binds
//! each segment to its object through the [`ObjectLedger`].
//!
//! Payload bytes go to the blob store *before* any metadata is written, so a
//! crash in between leaves an orphaned blob and never a segment or object
//! row pointing at a missing blob. Deleting segments releases references but
//! never deletes objects or blobs.

use crate::{
    models::{
        segment::{Segment, SegmentView},
        timerange::TimeRange,
    },
    services::{
        blob_store::{BlobError, BlobOperation, BlobStore},
        error::{CoreError, CoreResult},
        flow_registry::FlowRegistry,
        object_ledger::{self, ObjectLedger},
        storage_keys::derive_key,
    },
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SEGMENT_COLUMNS: &str = "id, flow_id, object_id, timerange, ts_offset, sample_offset, \
     sample_count, key_frame_count, storage_path, created";

/// Most objects a single allocation call may create.
pub const MAX_ALLOCATION: u32 = 1000;

/// A segment registration as sent by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSegment {
    pub id: Option<Uuid>,
    pub object_id: String,
    pub timerange: String,
    pub ts_offset: Option<String>,
    pub sample_offset: Option<i64>,
    pub sample_count: Option<i64>,
    pub key_frame_count: Option<i64>,

    /// Blob key to use for a new object. Derived when absent; ignored when
    /// the object already exists.
    pub storage_path: Option<String>,
}

/// A freshly allocated object awaiting its payload.
#[derive(Debug, Clone, Serialize)]
pub struct StorageAllocation {
    pub object_id: String,
    pub storage_path: String,
    pub put_url: String,
}

#[derive(Clone)]
pub struct SegmentStore {
    pub db: Arc<SqlitePool>,
    blobs: Arc<dyn BlobStore>,
    ledger: ObjectLedger,
    flows: FlowRegistry,

    /// Lifetime of the presigned URLs handed out by reads and allocations.
    url_ttl: Duration,
}

impl SegmentStore {
    pub fn new(
        db: Arc<SqlitePool>,
        blobs: Arc<dyn BlobStore>,
        ledger: ObjectLedger,
        flows: FlowRegistry,
        url_ttl: Duration,
    ) -> Self {
        Self {
            db,
            blobs,
            ledger,
            flows,
            url_ttl,
        }
    }

    /// Register a segment on a flow, writing `payload` first when non-empty.
    ///
    /// An empty payload registers metadata only, for objects whose bytes were
    /// (or will be) uploaded through a presigned URL. A payload for an object
    /// that already exists is refused: objects are written exactly once. A new
    /// object may not take a storage path that another object already owns.
    pub async fn create_segment(
        &self,
        flow_id: Uuid,
        new: NewSegment,
        payload: Bytes,
        content_type: Option<&str>,
    ) -> CoreResult<Segment> {
        let timerange = TimeRange::parse(&new.timerange)?;
        self.flows.writable_flow(flow_id).await?;

        let segment_id = new.id.unwrap_or_else(Uuid::new_v4);
        let existing = self.ledger.fetch_object(&new.object_id).await?;

        let (storage_path, new_object_size) = match &existing {
            Some(object) => {
                if !payload.is_empty() {
                    return Err(CoreError::ObjectImmutable(object.id.clone()));
                }
                debug!(object_id = %object.id, "binding segment to existing object");
                (object.storage_path.clone(), None)
            }
            None => {
                let storage_path = match new.storage_path.clone() {
                    Some(path) => path,
                    None => derive_key(flow_id, &segment_id.to_string(), &timerange)?,
                };
                if let Some(owner) = self.ledger.object_at_path(&storage_path).await? {
                    warn!(%flow_id, object_id = %owner.id, %storage_path, "storage path taken");
                    return Err(CoreError::ObjectImmutable(owner.id));
                }
                let size = if payload.is_empty() {
                    0
                } else {
                    self.write_new_blob(&storage_path, payload, content_type).await?
                };
                (storage_path, Some(size))
            }
        };

        let segment = Segment {
            id: segment_id,
            flow_id,
            object_id: new.object_id,
            timerange: timerange.to_string(),
            ts_offset: new.ts_offset,
            sample_offset: new.sample_offset,
            sample_count: new.sample_count,
            key_frame_count: new.key_frame_count,
            storage_path,
            created: Utc::now(),
        };

        let mut tx = self.db.begin().await?;
        if let Some(size) = new_object_size {
            object_ledger::insert_object(
                &mut *tx,
                &segment.object_id,
                &segment.storage_path,
                size,
            )
            .await
            .map_err(|err| object_conflict(err, &segment.object_id))?;
        }
        // Re-checks writability inside the transaction: the flow may have been
        // deleted or made read-only since the check above.
        let inserted = sqlx::query(
            "INSERT INTO segments (
                id, flow_id, object_id, timerange, ts_offset, sample_offset,
                sample_count, key_frame_count, storage_path, created
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM flows WHERE id = ? AND read_only = 0)",
        )
        .bind(segment.id)
        .bind(segment.flow_id)
        .bind(&segment.object_id)
        .bind(&segment.timerange)
        .bind(&segment.ts_offset)
        .bind(segment.sample_offset)
        .bind(segment.sample_count)
        .bind(segment.key_frame_count)
        .bind(&segment.storage_path)
        .bind(segment.created)
        .bind(flow_id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            drop(tx);
            self.flows.writable_flow(flow_id).await?;
            return Err(CoreError::not_found("flow", flow_id));
        }
        if !object_ledger::insert_reference(&mut *tx, &segment.object_id, flow_id).await? {
            return Err(CoreError::not_found("object", &segment.object_id));
        }
        tx.commit().await?;

        info!(
            %flow_id,
            segment_id = %segment.id,
            object_id = %segment.object_id,
            timerange = %segment.timerange,
            "created segment"
        );
        Ok(segment)
    }

    /// Write the payload of a new object without replacing anything.
    ///
    /// A blob already at `key` with identical bytes is left from an attempt
    /// that failed before its metadata commit, and is adopted. Different
    /// bytes are refused.
    async fn write_new_blob(
        &self,
        key: &str,
        payload: Bytes,
        content_type: Option<&str>,
    ) -> CoreResult<i64> {
        match self.blobs.put(key, payload.clone(), content_type).await {
            Ok(receipt) => Ok(receipt.size),
            Err(BlobError::AlreadyExists(_)) => {
                if self.blobs.get(key).await? == payload {
                    debug!(key, "adopting blob left by an earlier attempt");
                    Ok(payload.len() as i64)
                } else {
                    Err(BlobError::AlreadyExists(key.to_string()).into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Segments of a flow overlapping `query`, ordered by start, each with
    /// freshly signed download URLs.
    pub async fn list_segments(
        &self,
        flow_id: Uuid,
        query: Option<&TimeRange>,
    ) -> CoreResult<Vec<SegmentView>> {
        self.flows.get_flow(flow_id).await?;
        let segments = self.matching_segments(flow_id, query).await?;

        segments
            .into_iter()
            .map(|segment| -> CoreResult<SegmentView> {
                let url = self.blobs.presigned_url(
                    &segment.storage_path,
                    BlobOperation::Get,
                    self.url_ttl,
                )?;
                Ok(SegmentView {
                    segment,
                    get_urls: vec![url],
                })
            })
            .collect()
    }

    /// Payload bytes of one segment.
    pub async fn segment_payload(&self, flow_id: Uuid, segment_id: Uuid) -> CoreResult<Bytes> {
        let storage_path = sqlx::query_scalar::<_, String>(
            "SELECT storage_path FROM segments WHERE id = ? AND flow_id = ?",
        )
        .bind(segment_id)
        .bind(flow_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| CoreError::not_found("segment", segment_id))?;

        Ok(self.blobs.get(&storage_path).await?)
    }

    /// Total segments on a flow, without materialising rows.
    pub async fn count_segments(&self, flow_id: Uuid) -> CoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM segments WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// Segments on a flow overlapping `query`.
    pub async fn count_matching(
        &self,
        flow_id: Uuid,
        query: Option<&TimeRange>,
    ) -> CoreResult<i64> {
        match query {
            None => self.count_segments(flow_id).await,
            Some(_) => Ok(self.matching_segments(flow_id, query).await?.len() as i64),
        }
    }

    /// Remove segments overlapping `query` (all when `None`).
    ///
    /// Each segment row and one of its flow's references to the object go in
    /// a single metadata transaction. Segments already removed by a
    /// concurrent or earlier attempt are skipped, so retries converge.
    pub async fn delete_segments(
        &self,
        flow_id: Uuid,
        query: Option<&TimeRange>,
    ) -> CoreResult<u64> {
        self.flows.writable_flow(flow_id).await?;
        let segments = self.matching_segments(flow_id, query).await?;

        let mut removed = 0;
        for segment in &segments {
            let mut tx = self.db.begin().await?;
            let result = sqlx::query("DELETE FROM segments WHERE id = ?")
                .bind(segment.id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                object_ledger::delete_one_reference(&mut *tx, &segment.object_id, flow_id).await?;
                removed += 1;
            }
            tx.commit().await?;
        }

        info!(%flow_id, removed, matched = segments.len(), "deleted segments");
        Ok(removed)
    }

    /// Reserve `limit` new objects on a flow and sign upload URLs for them.
    ///
    /// Each object's key is derived from the flow, the object id and the
    /// timerange the caller intends to fill.
    pub async fn allocate_storage(
        &self,
        flow_id: Uuid,
        limit: u32,
        timerange: &TimeRange,
    ) -> CoreResult<Vec<StorageAllocation>> {
        self.flows.writable_flow(flow_id).await?;
        let limit = limit.clamp(1, MAX_ALLOCATION);

        let mut allocations = Vec::with_capacity(limit as usize);
        for _ in 0..limit {
            let object_id = Uuid::new_v4().to_string();
            let storage_path = derive_key(flow_id, &object_id, timerange)?;
            let put_url =
                self.blobs
                    .presigned_url(&storage_path, BlobOperation::Put, self.url_ttl)?;
            allocations.push(StorageAllocation {
                object_id,
                storage_path,
                put_url,
            });
        }

        let mut tx = self.db.begin().await?;
        for allocation in &allocations {
            object_ledger::insert_object(
                &mut *tx,
                &allocation.object_id,
                &allocation.storage_path,
                0,
            )
            .await?;
        }
        tx.commit().await?;

        info!(%flow_id, count = allocations.len(), "allocated storage");
        Ok(allocations)
    }

    /// Rows of a flow overlapping `query`, sorted by timerange start.
    ///
    /// The metadata store has no interval operator for this grammar, so
    /// filtering happens here after fetching every row of the flow.
    pub(crate) async fn matching_segments(
        &self,
        flow_id: Uuid,
        query: Option<&TimeRange>,
    ) -> CoreResult<Vec<Segment>> {
        let rows = sqlx::query_as::<_, Segment>(&format!(
            "SELECT {} FROM segments WHERE flow_id = ?",
            SEGMENT_COLUMNS
        ))
        .bind(flow_id)
        .fetch_all(&*self.db)
        .await?;

        let mut matching = Vec::with_capacity(rows.len());
        for row in rows {
            let range = row.parsed_timerange()?;
            if query.is_none_or(|q| q.overlaps(&range)) {
                matching.push((range.start(), row));
            }
        }
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matching.into_iter().map(|(_, row)| row).collect())
    }
}

/// A unique violation while inserting an object means another writer owns
/// its id or storage path.
fn object_conflict(err: sqlx::Error, object_id: &str) -> CoreError {
    let unique = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique {
        CoreError::ObjectImmutable(object_id.to_string())
    } else {
        err.into()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        db::memory_pool,
        models::flow::FlowFormat,
        services::{
            blob_store::{BlobReceipt, BlobResult, LocalBlobStore, UrlSigner},
            flow_registry::{NewFlow, NewSource},
        },
    };
    use async_trait::async_trait;
    use std::io;
    use tempfile::{TempDir, tempdir};

    pub(crate) struct Fixture {
        pub _dir: TempDir,
        pub blobs: Arc<LocalBlobStore>,
        pub flows: FlowRegistry,
        pub ledger: ObjectLedger,
        pub segments: SegmentStore,
        pub source_id: Uuid,
    }

    impl Fixture {
        pub async fn new() -> Self {
            let dir = tempdir().unwrap();
            let db = Arc::new(memory_pool().await);
            let blobs = Arc::new(LocalBlobStore::new(
                dir.path(),
                "http://localhost:3000",
                UrlSigner::new("secret"),
            ));
            let flows = FlowRegistry::new(db.clone());
            let ledger = ObjectLedger::new(db.clone(), blobs.clone());
            let segments = SegmentStore::new(
                db,
                blobs.clone(),
                ledger.clone(),
                flows.clone(),
                Duration::from_secs(60),
            );
            let source_id = flows
                .create_source(NewSource {
                    id: None,
                    format: FlowFormat::Video,
                    label: None,
                })
                .await
                .unwrap()
                .id;
            Self {
                _dir: dir,
                blobs,
                flows,
                ledger,
                segments,
                source_id,
            }
        }

        pub async fn flow(&self) -> Uuid {
            self.flows
                .create_flow(NewFlow {
                    id: None,
                    source_id: self.source_id,
                    format: FlowFormat::Video,
                    label: None,
                    read_only: false,
                })
                .await
                .unwrap()
                .id
        }

        /// Segment `[start:0_start+1:0)` bound to `object_id`, with a payload
        /// when the object is new.
        pub async fn segment(&self, flow_id: Uuid, object_id: &str, start: i64) -> Segment {
            let payload = match self.ledger.fetch_object(object_id).await.unwrap() {
                Some(_) => Bytes::new(),
                None => Bytes::from(format!("payload-{}", object_id)),
            };
            self.segments
                .create_segment(flow_id, new_segment(object_id, start), payload, None)
                .await
                .unwrap()
        }
    }

    pub(crate) fn new_segment(object_id: &str, start: i64) -> NewSegment {
        NewSegment {
            id: None,
            object_id: object_id.to_string(),
            timerange: format!("[{}:0_{}:0)", start, start + 1),
            ts_offset: None,
            sample_offset: None,
            sample_count: Some(25),
            key_frame_count: None,
            storage_path: None,
        }
    }

    #[tokio::test]
    async fn create_writes_payload_object_and_reference() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;

        let segment = fx.segment(flow, "obj-1", 1_700_000_000).await;
        assert_eq!(
            segment.storage_path,
            format!("{}/2023/11/14/{}", flow, segment.id)
        );
        assert_eq!(segment.timerange, "[1700000000:0_1700000001:0)");

        let object = fx.ledger.fetch_object("obj-1").await.unwrap().unwrap();
        assert_eq!(object.storage_path, segment.storage_path);
        assert_eq!(object.size, "payload-obj-1".len() as i64);
        assert_eq!(fx.ledger.reference_count("obj-1").await.unwrap(), 1);
        assert_eq!(
            fx.segments.segment_payload(flow, segment.id).await.unwrap(),
            Bytes::from_static(b"payload-obj-1")
        );
    }

    #[tokio::test]
    async fn invalid_timerange_is_rejected_before_any_write() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let mut new = new_segment("obj", 0);
        new.timerange = "[5:0_1:0)".into();

        let result = fx
            .segments
            .create_segment(flow, new, Bytes::from_static(b"x"), None)
            .await;
        assert!(matches!(result, Err(CoreError::InvalidGrammar(_))));
        assert!(fx.ledger.fetch_object("obj").await.unwrap().is_none());
        assert_eq!(fx.segments.count_segments(flow).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unbounded_start_cannot_derive_a_key() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let mut new = new_segment("obj", 0);
        new.timerange = "_".into();

        let result = fx
            .segments
            .create_segment(flow, new, Bytes::from_static(b"x"), None)
            .await;
        assert!(matches!(result, Err(CoreError::KeyDerivation(_))));
    }

    #[tokio::test]
    async fn reused_object_keeps_its_blob_and_refuses_new_bytes() {
        let fx = Fixture::new().await;
        let (a, b) = (fx.flow().await, fx.flow().await);
        let first = fx.segment(a, "shared", 10).await;
        let second = fx.segment(b, "shared", 20).await;
        assert_eq!(second.storage_path, first.storage_path);
        assert_eq!(fx.ledger.reference_count("shared").await.unwrap(), 2);

        let result = fx
            .segments
            .create_segment(a, new_segment("shared", 30), Bytes::from_static(b"new"), None)
            .await;
        assert!(matches!(result, Err(CoreError::ObjectImmutable(_))));
    }

    #[tokio::test]
    async fn metadata_only_registration_uses_explicit_path() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let mut new = new_segment("external", 0);
        new.storage_path = Some("preloaded/clip.ts".into());

        let segment = fx
            .segments
            .create_segment(flow, new, Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(segment.storage_path, "preloaded/clip.ts");
        assert!(fx.blobs.get("preloaded/clip.ts").await.is_err());
        assert_eq!(fx.ledger.fetch_object("external").await.unwrap().unwrap().size, 0);
    }

    #[tokio::test]
    async fn list_filters_by_overlap_and_signs_urls() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        fx.segment(flow, "o3", 3).await;
        fx.segment(flow, "o0", 0).await;
        fx.segment(flow, "o1", 1).await;

        let all = fx.segments.list_segments(flow, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|v| v.segment.object_id.as_str()).collect();
        assert_eq!(ids, vec!["o0", "o1", "o3"]);
        assert!(all[0].get_urls[0].contains("op=get"));

        let query = TimeRange::parse("[1:0_3:0)").unwrap();
        let some = fx.segments.list_segments(flow, Some(&query)).await.unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].segment.object_id, "o1");
        assert_eq!(fx.segments.count_matching(flow, Some(&query)).await.unwrap(), 1);

        let closed = TimeRange::parse("[1:0_3:0]").unwrap();
        assert_eq!(fx.segments.count_matching(flow, Some(&closed)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn listing_unknown_flow_is_not_found() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.segments.list_segments(Uuid::new_v4(), None).await,
            Err(CoreError::NotFound { kind: "flow", .. })
        ));
    }

    #[tokio::test]
    async fn deleting_segments_releases_references_but_keeps_objects() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        for (i, object) in ["a", "b", "c"].into_iter().enumerate() {
            fx.segment(flow, object, i as i64).await;
        }

        assert_eq!(fx.segments.delete_segments(flow, None).await.unwrap(), 3);
        assert_eq!(fx.segments.count_segments(flow).await.unwrap(), 0);
        for object in ["a", "b", "c"] {
            assert!(fx.ledger.can_delete(object).await.unwrap());
            assert!(fx.ledger.fetch_object(object).await.unwrap().is_some());
        }

        assert_eq!(fx.segments.delete_segments(flow, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shared_object_is_deletable_only_after_last_reference() {
        let fx = Fixture::new().await;
        let flows = [fx.flow().await, fx.flow().await, fx.flow().await];
        for flow in flows {
            fx.segment(flow, "shared", 0).await;
        }

        for (i, flow) in flows.iter().enumerate() {
            assert!(!fx.ledger.can_delete("shared").await.unwrap());
            fx.segments.delete_segments(*flow, None).await.unwrap();
            assert_eq!(
                fx.ledger.can_delete("shared").await.unwrap(),
                i == flows.len() - 1
            );
        }
        fx.ledger.delete_object("shared").await.unwrap();
    }

    #[tokio::test]
    async fn partial_delete_by_timerange() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        fx.segment(flow, "early", 0).await;
        fx.segment(flow, "late", 10).await;

        let query = TimeRange::parse("[5:0_)").unwrap();
        assert_eq!(fx.segments.delete_segments(flow, Some(&query)).await.unwrap(), 1);
        let left = fx.segments.list_segments(flow, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].segment.object_id, "early");
        assert!(fx.ledger.can_delete("late").await.unwrap());
    }

    #[tokio::test]
    async fn read_only_flow_blocks_mutation() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        fx.segment(flow, "o", 0).await;
        fx.flows.set_read_only(flow, true).await.unwrap();

        assert!(matches!(
            fx.segments.delete_segments(flow, None).await,
            Err(CoreError::ReadOnly(_))
        ));
        assert!(matches!(
            fx.segments
                .create_segment(flow, new_segment("p", 1), Bytes::from_static(b"x"), None)
                .await,
            Err(CoreError::ReadOnly(_))
        ));
        let range = TimeRange::parse("[0:0_1:0)").unwrap();
        assert!(matches!(
            fx.segments.allocate_storage(flow, 1, &range).await,
            Err(CoreError::ReadOnly(_))
        ));
        assert_eq!(fx.segments.list_segments(flow, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn allocated_objects_can_back_segments() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let range = TimeRange::parse("[86400:0_86410:0)").unwrap();

        let allocations = fx.segments.allocate_storage(flow, 2, &range).await.unwrap();
        assert_eq!(allocations.len(), 2);
        let first = &allocations[0];
        assert_eq!(
            first.storage_path,
            format!("{}/1970/01/02/{}", flow, first.object_id)
        );
        assert!(first.put_url.contains("op=put"));

        let segment = fx
            .segments
            .create_segment(flow, new_segment(&first.object_id, 86400), Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(segment.storage_path, first.storage_path);
        assert_eq!(fx.ledger.reference_count(&first.object_id).await.unwrap(), 1);
        assert!(fx.ledger.can_delete(&allocations[1].object_id).await.unwrap());
    }

    #[tokio::test]
    async fn new_object_cannot_take_an_owned_storage_path() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let victim = fx.segment(flow, "victim", 10).await;

        let mut new = new_segment("intruder", 20);
        new.storage_path = Some(victim.storage_path.clone());
        let result = fx
            .segments
            .create_segment(flow, new, Bytes::from_static(b"other bytes"), None)
            .await;

        assert!(matches!(result, Err(CoreError::ObjectImmutable(id)) if id == "victim"));
        assert_eq!(
            fx.blobs.get(&victim.storage_path).await.unwrap(),
            Bytes::from_static(b"payload-victim")
        );
        assert!(fx.ledger.fetch_object("intruder").await.unwrap().is_none());
        assert_eq!(fx.segments.count_segments(flow).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reused_segment_id_cannot_rewrite_a_derived_key() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let mut new = new_segment("first", 10);
        new.id = Some(Uuid::new_v4());
        let first = fx
            .segments
            .create_segment(flow, new.clone(), Bytes::from_static(b"first"), None)
            .await
            .unwrap();
        fx.segments.delete_segments(flow, None).await.unwrap();

        new.object_id = "second".into();
        let result = fx
            .segments
            .create_segment(flow, new, Bytes::from_static(b"second"), None)
            .await;

        assert!(matches!(result, Err(CoreError::ObjectImmutable(id)) if id == "first"));
        assert_eq!(
            fx.blobs.get(&first.storage_path).await.unwrap(),
            Bytes::from_static(b"first")
        );
    }

    #[tokio::test]
    async fn leftover_blob_is_adopted_only_when_identical() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let range = TimeRange::parse("[10:0_11:0)").unwrap();
        let (same, other) = (Uuid::new_v4(), Uuid::new_v4());
        for id in [same, other] {
            let key = derive_key(flow, &id.to_string(), &range).unwrap();
            fx.blobs
                .put(&key, Bytes::from_static(b"left over"), None)
                .await
                .unwrap();
        }

        let mut retry = new_segment("retried", 10);
        retry.id = Some(same);
        let segment = fx
            .segments
            .create_segment(flow, retry, Bytes::from_static(b"left over"), None)
            .await
            .unwrap();
        assert_eq!(
            fx.ledger.fetch_object("retried").await.unwrap().unwrap().size,
            "left over".len() as i64
        );
        assert_eq!(segment.id, same);

        let mut clash = new_segment("clashing", 10);
        clash.id = Some(other);
        let result = fx
            .segments
            .create_segment(flow, clash, Bytes::from_static(b"fresh"), None)
            .await;
        assert!(matches!(
            result,
            Err(CoreError::StorageWriteFailed(BlobError::AlreadyExists(_)))
        ));
        assert!(fx.ledger.fetch_object("clashing").await.unwrap().is_none());
    }

    /// Blob store whose every write and read fails.
    struct FailingBlobs;

    #[async_trait]
    impl BlobStore for FailingBlobs {
        async fn put(
            &self,
            _key: &str,
            _bytes: Bytes,
            _content_type: Option<&str>,
        ) -> BlobResult<BlobReceipt> {
            Err(BlobError::Io(io::Error::other("disk full")))
        }

        async fn get(&self, _key: &str) -> BlobResult<Bytes> {
            Err(BlobError::Io(io::Error::other("disk full")))
        }

        async fn delete(&self, _key: &str) -> BlobResult<()> {
            Err(BlobError::Io(io::Error::other("disk full")))
        }

        fn presigned_url(
            &self,
            key: &str,
            _operation: BlobOperation,
            _ttl: Duration,
        ) -> BlobResult<String> {
            Ok(format!("http://failing/{}", key))
        }
    }

    #[tokio::test]
    async fn failed_blob_write_leaves_no_metadata() {
        let fx = Fixture::new().await;
        let flow = fx.flow().await;
        let segments = SegmentStore::new(
            fx.segments.db.clone(),
            Arc::new(FailingBlobs),
            fx.ledger.clone(),
            fx.flows.clone(),
            Duration::from_secs(60),
        );

        let result = segments
            .create_segment(flow, new_segment("obj", 0), Bytes::from_static(b"x"), None)
            .await;

        assert!(matches!(
            result,
            Err(CoreError::StorageWriteFailed(BlobError::Io(_)))
        ));
        assert!(fx.ledger.fetch_object("obj").await.unwrap().is_none());
        assert_eq!(fx.segments.count_segments(flow).await.unwrap(), 0);
        assert_eq!(fx.ledger.reference_count("obj").await.unwrap(), 0);
    }
}
