//! HTTP handlers for uploaded images.
//!
//! Every handler builds its own scoped client from the caller's credential
//! and hands it to `CaptionService`; the client is dropped when the handler
//! returns.

use crate::{
    errors::AppError,
    middleware::auth::AuthContext,
    models::uploaded_file::{BulkItemResult, UploadedFile},
    services::caption_service::ImageUpload,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_BULK_ITEMS: usize = 50;

/// Body for the id-based bulk endpoints.
#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BulkResponse {
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkItemResult>,
}

impl From<Vec<BulkItemResult>> for BulkResponse {
    fn from(results: Vec<BulkItemResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.ok).count();
        Self {
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }
}

/// `POST /files`: multipart field `file`.
pub async fn upload_file(
    State(state): State<AppState>,
    auth: AuthContext,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let client = state.clients.client_for(&auth)?;
    let upload = read_uploads(multipart, &["file"], state.config.max_upload_bytes, 1)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::bad_request("multipart field `file` is required"))?;

    let record = state.captions.upload_and_analyze(&client, upload).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `POST /files/bulk`: one or more multipart fields named `files`.
pub async fn upload_files(
    State(state): State<AppState>,
    auth: AuthContext,
    multipart: Multipart,
) -> Result<Json<BulkResponse>, AppError> {
    let client = state.clients.client_for(&auth)?;
    let uploads = read_uploads(
        multipart,
        &["files", "file"],
        state.config.max_upload_bytes,
        MAX_BULK_ITEMS,
    )
    .await?;
    if uploads.is_empty() {
        return Err(AppError::bad_request("at least one file is required"));
    }

    let results = state
        .captions
        .upload_and_analyze_many(&client, uploads)
        .await;
    Ok(Json(results.into()))
}

/// `GET /files`
pub async fn list_files(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<UploadedFile>>, AppError> {
    let client = state.clients.client_for(&auth)?;
    Ok(Json(state.captions.list(&client).await?))
}

/// `GET /files/{id}`
pub async fn get_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadedFile>, AppError> {
    let client = state.clients.client_for(&auth)?;
    Ok(Json(state.captions.get(&client, id).await?))
}

/// `POST /files/{id}/analyze`
pub async fn reanalyze_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadedFile>, AppError> {
    let client = state.clients.client_for(&auth)?;
    Ok(Json(state.captions.reanalyze(&client, id).await?))
}

/// `POST /files/analyze`: `{"ids": [...]}`
pub async fn reanalyze_files(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<IdsRequest>,
) -> Result<Json<BulkResponse>, AppError> {
    ensure_batch_size(body.ids.len())?;
    let client = state.clients.client_for(&auth)?;
    let results = state.captions.reanalyze_many(&client, &body.ids).await;
    Ok(Json(results.into()))
}

/// `DELETE /files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let client = state.clients.client_for(&auth)?;
    state.captions.delete(&client, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /files/delete`: `{"ids": [...]}`
pub async fn delete_files(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<IdsRequest>,
) -> Result<Json<BulkResponse>, AppError> {
    ensure_batch_size(body.ids.len())?;
    let client = state.clients.client_for(&auth)?;
    let results = state.captions.delete_many(&client, &body.ids).await;
    Ok(Json(results.into()))
}

fn ensure_batch_size(len: usize) -> Result<(), AppError> {
    if len > MAX_BULK_ITEMS {
        return Err(too_many_items(MAX_BULK_ITEMS));
    }
    Ok(())
}

fn too_many_items(limit: usize) -> AppError {
    AppError::bad_request(format!("at most {} items per request", limit))
}

/// Collect file parts whose field name is one of `accepted`; other fields are
/// ignored. Each file is held to `max_bytes`, and the request is refused as
/// soon as a part beyond `max_files` arrives, before its body is read.
async fn read_uploads(
    mut multipart: Multipart,
    accepted: &[&str],
    max_bytes: usize,
    max_files: usize,
) -> Result<Vec<ImageUpload>, AppError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let wanted = field
            .name()
            .map(|name| accepted.contains(&name))
            .unwrap_or(false);
        if !wanted {
            continue;
        }
        if uploads.len() == max_files {
            return Err(too_many_items(max_files));
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await?;
        if bytes.len() > max_bytes {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("`{}` exceeds the {} byte limit", file_name, max_bytes),
            ));
        }
        uploads.push(ImageUpload {
            file_name,
            content_type,
            bytes,
        });
    }
    Ok(uploads)
}
