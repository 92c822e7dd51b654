//! Error taxonomy shared by the segment, object and deletion services.

use crate::{
    models::timerange::TimeRangeError,
    services::{blob_store::BlobError, storage_keys::KeyError},
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    InvalidGrammar(#[from] TimeRangeError),
    #[error(transparent)]
    KeyDerivation(#[from] KeyError),
    #[error("object `{0}` is still referenced by at least one flow")]
    StillReferenced(String),
    #[error("{kind} `{id}` has {count} dependent segment(s); retry with cascade")]
    DependentsExist {
        kind: &'static str,
        id: Uuid,
        count: i64,
    },
    #[error("sources are immutable and can never be deleted")]
    SourcesAreImmutable,
    #[error(
        "flow `{flow_id}` has {count} matching segment(s), \
         above the synchronous deletion threshold of {threshold}"
    )]
    TooManyDependents {
        flow_id: Uuid,
        count: i64,
        threshold: u64,
    },
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("flow `{0}` is read-only")]
    ReadOnly(Uuid),
    #[error("object `{0}` already exists and its payload cannot be rewritten")]
    ObjectImmutable(String),
    #[error("upload to object `{0}` carried no bytes")]
    EmptyPayload(String),
    #[error("blob store operation failed: {0}")]
    StorageWriteFailed(#[from] BlobError),
    #[error("metadata store operation failed: {0}")]
    MetadataWriteFailed(#[from] sqlx::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
