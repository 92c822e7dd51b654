//! Sources and the flows they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Media kind of a source or flow.
///
/// Segment and object handling never branches on this; it is carried for
/// clients that do.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FlowFormat {
    Video,
    Audio,
    Data,
    Image,
    Multi,
}

/// A source groups flows that are renditions of the same content.
///
/// Sources are never deleted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Source {
    pub id: Uuid,
    pub format: FlowFormat,
    pub label: Option<String>,
    pub created: DateTime<Utc>,
}

/// A time-ordered sequence of segments belonging to one source.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Flow {
    pub id: Uuid,
    pub source_id: Uuid,
    pub format: FlowFormat,
    pub label: Option<String>,

    /// Blocks segment writes, storage allocation and deletion.
    pub read_only: bool,

    pub created: DateTime<Utc>,
}
