//! Immutable blob records and the flows that reference them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An immutable blob held in the blob store.
///
/// Only the access bookkeeping columns ever change after insert.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: String,

    /// Blob key the payload lives under.
    pub storage_path: String,

    /// Payload size in bytes: 0 until a pre-allocated object is uploaded,
    /// -1 while that upload is in flight.
    pub size: i64,

    pub created: DateTime<Utc>,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Records that a flow depends on an object through one of its segments.
///
/// One row is written per binding segment, so a flow may appear more than
/// once for the same object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FlowObjectReference {
    pub object_id: String,
    pub flow_id: Uuid,
    pub created: DateTime<Utc>,
}

/// An object together with the distinct flows currently referencing it.
#[derive(Serialize, Debug)]
pub struct ObjectView {
    #[serde(flatten)]
    pub object: Object,
    pub referenced_by_flows: Vec<Uuid>,
}
