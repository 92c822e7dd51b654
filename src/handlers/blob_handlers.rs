//! Presigned access to the local blob store.
//! Bodies are streamed in both directions to avoid buffering payloads in
//! memory.

use crate::{
    errors::AppError,
    handlers::AppState,
    services::blob_store::{BlobError, BlobOperation},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Query string of a presigned URL.
#[derive(Debug, Deserialize)]
pub struct PresignedQuery {
    pub op: BlobOperation,
    pub expires: i64,
    pub signature: String,
}

impl PresignedQuery {
    fn verify(&self, state: &AppState, key: &str, expected: BlobOperation) -> Result<(), AppError> {
        if self.op != expected {
            return Err(BlobError::InvalidSignature("wrong operation").into());
        }
        state
            .blobs
            .verify_presigned(key, self.op, self.expires, &self.signature)?;
        Ok(())
    }
}

/// GET `/blobs/{*key}`: download through a presigned URL.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<PresignedQuery>,
) -> Result<Response, AppError> {
    q.verify(&state, &key, BlobOperation::Get)?;

    let file = state.blobs.open(&key).await?;
    let len = file.metadata().await.map_err(BlobError::from)?.len();
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}

/// PUT `/blobs/{*key}`: upload the payload of an allocated object.
///
/// The key must belong to an object that has no payload yet. The object's
/// upload slot is claimed before any bytes are written and released again
/// if the upload fails or carries no bytes.
pub async fn put_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<PresignedQuery>,
    body: Body,
) -> Result<Response, AppError> {
    q.verify(&state, &key, BlobOperation::Put)?;
    let object = state.ledger.claim_upload(&key).await?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let receipt = match state.blobs.put_stream(&key, stream).await {
        Ok(receipt) => receipt,
        Err(err) => {
            state.ledger.release_upload(&object.id).await?;
            return Err(err.into());
        }
    };
    state.ledger.complete_upload(&object, receipt.size).await?;

    let mut resp_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", receipt.etag)) {
        resp_headers.insert(header::ETAG, value);
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = resp_headers;
    Ok(response)
}
