//! src/services/object_ledger.rs
//!
//! ObjectLedger: tracks which flows reference which objects and gates
//! physical object deletion on that reference count.
//!
//! An object may back segments of many flows. Every segment binding writes
//! one `flow_object_references` row and every segment removal deletes one,
//! so the number of distinct `flow_id`s per object is the reference count.
//! Objects with a non-zero count are never deleted.

use crate::{
    models::object::{FlowObjectReference, Object, ObjectView},
    services::{
        blob_store::BlobStore,
        error::{CoreError, CoreResult},
    },
};
use chrono::Utc;
use sqlx::{Executor, Sqlite, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `objects.size` while a presigned upload is writing the blob.
pub const UPLOAD_IN_PROGRESS: i64 = -1;

const OBJECT_COLUMNS: &str = "id, storage_path, size, created, access_count, last_accessed";

#[derive(Clone)]
pub struct ObjectLedger {
    pub db: Arc<SqlitePool>,
    blobs: Arc<dyn BlobStore>,
}

impl ObjectLedger {
    pub fn new(db: Arc<SqlitePool>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Record that `flow_id` depends on `object_id`.
    ///
    /// Duplicate bindings add duplicate rows; counting is by distinct flow.
    pub async fn add_reference(&self, object_id: &str, flow_id: Uuid) -> CoreResult<()> {
        if !insert_reference(&*self.db, object_id, flow_id).await? {
            return Err(CoreError::not_found("object", object_id));
        }
        debug!(object_id, %flow_id, "added object reference");
        Ok(())
    }

    /// Drop one reference row. Returns `false` when there was none to drop.
    pub async fn remove_reference(&self, object_id: &str, flow_id: Uuid) -> CoreResult<bool> {
        let removed = delete_one_reference(&*self.db, object_id, flow_id).await?;
        debug!(object_id, %flow_id, removed, "removed object reference");
        Ok(removed)
    }

    /// Number of distinct flows currently referencing the object.
    pub async fn reference_count(&self, object_id: &str) -> CoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT flow_id) FROM flow_object_references WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    pub async fn can_delete(&self, object_id: &str) -> CoreResult<bool> {
        Ok(self.reference_count(object_id).await? == 0)
    }

    pub async fn referencing_flows(&self, object_id: &str) -> CoreResult<Vec<Uuid>> {
        let flows = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT flow_id FROM flow_object_references WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(flows)
    }

    /// Raw reference rows for an object, oldest first. A flow appears once per
    /// segment binding it to the object.
    pub async fn references(&self, object_id: &str) -> CoreResult<Vec<FlowObjectReference>> {
        let rows = sqlx::query_as::<_, FlowObjectReference>(
            "SELECT object_id, flow_id, created FROM flow_object_references
             WHERE object_id = ? ORDER BY created",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Read an object for a client, bumping its access bookkeeping.
    pub async fn get_object(&self, object_id: &str) -> CoreResult<ObjectView> {
        let result = sqlx::query(
            "UPDATE objects SET access_count = access_count + 1, last_accessed = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(object_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("object", object_id));
        }

        let object = self
            .fetch_object(object_id)
            .await?
            .ok_or_else(|| CoreError::not_found("object", object_id))?;
        let referenced_by_flows = self.referencing_flows(object_id).await?;

        Ok(ObjectView {
            object,
            referenced_by_flows,
        })
    }

    /// Object row without touching access bookkeeping.
    pub(crate) async fn fetch_object(&self, object_id: &str) -> CoreResult<Option<Object>> {
        let object = sqlx::query_as::<_, Object>(&format!(
            "SELECT {} FROM objects WHERE id = ?",
            OBJECT_COLUMNS
        ))
        .bind(object_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    /// The object whose blob lives at `storage_path`, if any.
    pub(crate) async fn object_at_path(&self, storage_path: &str) -> CoreResult<Option<Object>> {
        let object = sqlx::query_as::<_, Object>(&format!(
            "SELECT {} FROM objects WHERE storage_path = ?",
            OBJECT_COLUMNS
        ))
        .bind(storage_path)
        .fetch_optional(&*self.db)
        .await?;
        Ok(object)
    }

    /// Claim the upload slot of the payload-less object at `storage_path`.
    ///
    /// The claim is a single conditional update, so of two concurrent
    /// uploads exactly one wins; the other, and any upload to an object that
    /// already holds bytes, gets `ObjectImmutable`.
    pub async fn claim_upload(&self, storage_path: &str) -> CoreResult<Object> {
        let claimed = sqlx::query_as::<_, Object>(&format!(
            "UPDATE objects SET size = ? WHERE storage_path = ? AND size = 0 RETURNING {}",
            OBJECT_COLUMNS
        ))
        .bind(UPLOAD_IN_PROGRESS)
        .bind(storage_path)
        .fetch_optional(&*self.db)
        .await?;
        if let Some(object) = claimed {
            debug!(object_id = %object.id, storage_path, "claimed upload slot");
            return Ok(object);
        }

        let owner = self
            .object_at_path(storage_path)
            .await?
            .ok_or_else(|| CoreError::not_found("object", storage_path))?;
        warn!(object_id = %owner.id, size = owner.size, "refusing upload to a written object");
        Err(CoreError::ObjectImmutable(owner.id))
    }

    /// Hand an unfinished upload slot back so the object can be uploaded again.
    pub async fn release_upload(&self, object_id: &str) -> CoreResult<()> {
        sqlx::query("UPDATE objects SET size = 0 WHERE id = ? AND size = ?")
            .bind(object_id)
            .bind(UPLOAD_IN_PROGRESS)
            .execute(&*self.db)
            .await?;
        debug!(object_id, "released upload slot");
        Ok(())
    }

    /// Record the payload written under a claimed upload slot.
    ///
    /// An empty payload is refused: its blob is removed and the slot
    /// released, so the object stays uploadable.
    pub async fn complete_upload(&self, object: &Object, size: i64) -> CoreResult<()> {
        if size <= 0 {
            self.blobs.delete(&object.storage_path).await?;
            self.release_upload(&object.id).await?;
            return Err(CoreError::EmptyPayload(object.id.clone()));
        }

        let result = sqlx::query("UPDATE objects SET size = ? WHERE id = ? AND size = ?")
            .bind(size)
            .bind(&object.id)
            .bind(UPLOAD_IN_PROGRESS)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::ObjectImmutable(object.id.clone()));
        }
        info!(object_id = %object.id, size, "recorded object upload");
        Ok(())
    }

    /// Delete an unreferenced object and its blob.
    ///
    /// The reference check runs first and refuses with `StillReferenced`
    /// without mutating anything. The row delete itself is conditional on
    /// there still being no references, so a reference added after the check
    /// also blocks the delete. The blob goes last; a failure there leaves an
    /// orphaned blob, never a row pointing at a missing one.
    pub async fn delete_object(&self, object_id: &str) -> CoreResult<Object> {
        let object = self
            .fetch_object(object_id)
            .await?
            .ok_or_else(|| CoreError::not_found("object", object_id))?;

        if !self.can_delete(object_id).await? {
            warn!(object_id, "refusing to delete referenced object");
            return Err(CoreError::StillReferenced(object_id.to_string()));
        }

        let result = sqlx::query(
            "DELETE FROM objects WHERE id = ?
             AND NOT EXISTS (SELECT 1 FROM flow_object_references WHERE object_id = ?)",
        )
        .bind(object_id)
        .bind(object_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            warn!(object_id, "object gained a reference while being deleted");
            return Err(CoreError::StillReferenced(object_id.to_string()));
        }

        self.blobs.delete(&object.storage_path).await?;
        info!(object_id, storage_path = %object.storage_path, "deleted object");
        Ok(object)
    }
}

/// Insert an object row.
pub(crate) async fn insert_object<'e, E>(
    executor: E,
    object_id: &str,
    storage_path: &str,
    size: i64,
) -> Result<Object, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Object>(&format!(
        "INSERT INTO objects (id, storage_path, size, created, access_count)
         VALUES (?, ?, ?, ?, 0)
         RETURNING {}",
        OBJECT_COLUMNS
    ))
    .bind(object_id)
    .bind(storage_path)
    .bind(size)
    .bind(Utc::now())
    .fetch_one(executor)
    .await
}

/// Insert a reference row, only if the object exists.
pub(crate) async fn insert_reference<'e, E>(
    executor: E,
    object_id: &str,
    flow_id: Uuid,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO flow_object_references (object_id, flow_id, created)
         SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM objects WHERE id = ?)",
    )
    .bind(object_id)
    .bind(flow_id)
    .bind(Utc::now())
    .bind(object_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete exactly one reference row for the pair, if any exists.
pub(crate) async fn delete_one_reference<'e, E>(
    executor: E,
    object_id: &str,
    flow_id: Uuid,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "DELETE FROM flow_object_references WHERE rowid = (
             SELECT rowid FROM flow_object_references
             WHERE object_id = ? AND flow_id = ? LIMIT 1
         )",
    )
    .bind(object_id)
    .bind(flow_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}
