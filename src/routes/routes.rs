//! Defines routes for the flow, segment and object API.
//!
//! ## Structure
//! - **Sources and flows**
//!   - `POST   /sources`, `GET /sources/{id}`, `DELETE /sources/{id}` (always 403)
//!   - `POST   /flows`, `GET /flows/{id}`, `DELETE /flows/{id}?cascade=&mode=`
//!   - `PUT    /flows/{id}/read_only`
//!
//! - **Segments**
//!   - `GET | POST | DELETE /flows/{id}/segments`: `?timerange=` filters
//!   - `GET    /flows/{id}/segments/{segment_id}/payload`
//!   - `POST   /flows/{id}/storage`: allocate objects with presigned upload URLs
//!
//! - **Objects and deletion requests**
//!   - `GET | DELETE /objects/{id}`
//!   - `GET /flow-delete-requests`, `GET /flow-delete-requests/{id}`
//!   - `GET | PUT /service/deletion-threshold`
//!
//! - **Blobs**
//!   - `GET | PUT /blobs/{*key}`: presigned access; the wildcard allows
//!     nested keys like `{flow}/2024/01/02/{object}`.

use crate::handlers::{
    AppState,
    blob_handlers::{get_blob, put_blob},
    flow_handlers::{
        create_flow, create_source, delete_flow, delete_source, get_flow, get_source,
        set_read_only,
    },
    object_handlers::{delete_object, get_object},
    segment_handlers::{
        allocate_storage, create_segment, delete_segments, get_segment_payload, list_segments,
    },
    service_handlers::{get_deletion_request, get_threshold, list_deletion_requests, set_threshold},
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build the router for the whole API.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sources", post(create_source))
        .route("/sources/{id}", get(get_source).delete(delete_source))
        .route("/flows", post(create_flow))
        .route("/flows/{id}", get(get_flow).delete(delete_flow))
        .route("/flows/{id}/read_only", put(set_read_only))
        .route(
            "/flows/{id}/segments",
            get(list_segments)
                .post(create_segment)
                .delete(delete_segments),
        )
        .route(
            "/flows/{id}/segments/{segment_id}/payload",
            get(get_segment_payload),
        )
        .route("/flows/{id}/storage", post(allocate_storage))
        .route("/objects/{id}", get(get_object).delete(delete_object))
        .route("/flow-delete-requests", get(list_deletion_requests))
        .route("/flow-delete-requests/{id}", get(get_deletion_request))
        .route(
            "/service/deletion-threshold",
            get(get_threshold).put(set_threshold),
        )
        .route("/blobs/{*key}", get(get_blob).put(put_blob))
}
