//! Queued deletion requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeletionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A deletion too large to run inside the calling request.
///
/// Removes the flow's segments overlapping `timerange`, then the flow row
/// itself when `delete_flow` is set.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DeletionRequest {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub timerange: String,
    pub delete_flow: bool,
    pub status: DeletionStatus,
    pub deleted_by: Option<String>,

    /// Failure cause when `status` is `failed`.
    pub error: Option<String>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}
