//! Segment metadata rows.

use crate::models::timerange::{TimeRange, TimeRangeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One time-ranged slice of a flow, bound to one object.
///
/// `timerange`, `object_id` and `storage_path` are fixed at creation.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Segment {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub object_id: String,

    /// Canonical string form of the segment's timerange.
    pub timerange: String,

    pub ts_offset: Option<String>,
    pub sample_offset: Option<i64>,
    pub sample_count: Option<i64>,
    pub key_frame_count: Option<i64>,

    /// Blob key of the backing object, persisted once and never re-derived.
    pub storage_path: String,

    pub created: DateTime<Utc>,
}

impl Segment {
    pub fn parsed_timerange(&self) -> Result<TimeRange, TimeRangeError> {
        TimeRange::parse(&self.timerange)
    }
}

/// A segment as returned to readers, with freshly signed download URLs.
#[derive(Serialize, Debug)]
pub struct SegmentView {
    #[serde(flatten)]
    pub segment: Segment,
    pub get_urls: Vec<String>,
}
