//! Defines routes for upload, analysis and housekeeping operations.
//!
//! ## Structure
//! - **Probes** (no auth)
//!   - `GET    /healthz`
//!   - `GET    /readyz`
//!
//! - **File endpoints** (Bearer token required)
//!   - `POST   /files`             : upload + analyze one image
//!   - `GET    /files`             : list the caller's images
//!   - `POST   /files/bulk`        : upload + analyze many images
//!   - `POST   /files/analyze`     : re-analyze many by id
//!   - `POST   /files/delete`      : delete many by id
//!   - `GET    /files/{id}`        : fetch one record
//!   - `DELETE /files/{id}`        : delete object and record
//!   - `POST   /files/{id}/analyze`: re-analyze one image

use crate::{
    errors::AppError,
    handlers::{
        file_handlers::{
            delete_file, delete_files, get_file, list_files, reanalyze_file, reanalyze_files,
            upload_file, upload_files,
        },
        health_handlers::{healthz, readyz},
    },
    middleware::auth::auth_middleware,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{StatusCode, Uri},
    middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Multipart framing overhead allowed on top of the configured file size.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the application router with its state attached.
///
/// File routes sit behind the auth middleware; the health checks do not.
pub fn routes(state: AppState) -> Router {
    let body_limit = state
        .config
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let files = Router::new()
        .route("/files", post(upload_file).get(list_files))
        .route(
            "/files/bulk",
            // Bulk uploads may carry several files.
            post(upload_files).layer(DefaultBodyLimit::max(body_limit.saturating_mul(10))),
        )
        .route("/files/analyze", post(reanalyze_files))
        .route("/files/delete", post(delete_files))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/analyze", post(reanalyze_file))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(files)
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn route_not_found(uri: Uri) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, format!("no route for {}", uri.path()))
}
