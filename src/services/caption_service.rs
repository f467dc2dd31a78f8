//! Upload and analysis orchestration.
//!
//! Ordering for a new upload: bytes are written to storage, the vision service
//! is asked about the signed URL, then the row is inserted. A failure after the
//! storage write leaves the object in the bucket; nothing compensates for it.
//! Bulk operations run every item independently and report per-item outcomes.

use crate::{
    models::uploaded_file::{BulkItemResult, NewUploadedFile, UploadedFile},
    services::{
        file_records::RecordError,
        scoped_client::ScopedClient,
        storage_provider::{StorageError, UploadOptions},
        vision::{VisionClient, VisionError},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CACHE_CONTROL: &str = "3600";

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("unsupported media type `{0}`, only images are accepted")]
    UnsupportedMediaType(String),
    #[error("uploaded file is empty")]
    EmptyUpload,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type CaptionResult<T> = Result<T, CaptionError>;

/// An incoming file as received from the client.
#[derive(Clone, Debug)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

pub struct CaptionService {
    vision: Arc<dyn VisionClient>,
}

impl CaptionService {
    pub fn new(vision: Arc<dyn VisionClient>) -> Self {
        Self { vision }
    }

    /// Store an image, caption it and record the result for the caller.
    pub async fn upload_and_analyze(
        &self,
        client: &ScopedClient,
        upload: ImageUpload,
    ) -> CaptionResult<UploadedFile> {
        let extension = extension_for(&upload.content_type)
            .ok_or_else(|| CaptionError::UnsupportedMediaType(upload.content_type.clone()))?;
        if upload.bytes.is_empty() {
            return Err(CaptionError::EmptyUpload);
        }

        let path = format!("{}/{}.{}", client.identity, Uuid::new_v4(), extension);
        let size_bytes = i64::try_from(upload.bytes.len()).unwrap_or(i64::MAX);
        let options = UploadOptions {
            cache_control: Some(CACHE_CONTROL.into()),
            ..UploadOptions::new(upload.content_type.clone())
        };

        let stored = client.storage.upload(upload.bytes, &path, &options).await?;
        info!(
            "stored {} ({} bytes) for user {}",
            stored.path, size_bytes, client.identity
        );

        let analysis = self.vision.describe(&stored.url.url).await.map_err(|err| {
            warn!("analysis of {} failed, object left in bucket: {}", stored.path, err);
            err
        })?;

        let record = client
            .records
            .insert(NewUploadedFile {
                user_id: client.identity,
                path: stored.path,
                file_name: upload.file_name,
                content_type: upload.content_type,
                size_bytes,
                signed_url: stored.url,
                analysis,
            })
            .await?;
        Ok(record)
    }

    /// Caption a stored image again.
    ///
    /// A new signed URL is always issued first; the stored one may have
    /// expired and the vision service cannot authenticate to storage itself.
    pub async fn reanalyze(&self, client: &ScopedClient, id: Uuid) -> CaptionResult<UploadedFile> {
        let record = client.records.get(id).await?;
        if record.url_expired_at(Utc::now()) {
            debug!(
                "stored URL for {} expired at {}",
                record.path, record.url_expires_at
            );
        }
        let fresh = client.storage.url_for(&record.path).await?;
        let analysis = self.vision.describe(&fresh.url).await?;
        let updated = client
            .records
            .update_analysis(id, &fresh, &analysis)
            .await?;
        info!("re-analyzed {} for user {}", updated.path, client.identity);
        Ok(updated)
    }

    pub async fn upload_and_analyze_many(
        &self,
        client: &ScopedClient,
        uploads: Vec<ImageUpload>,
    ) -> Vec<BulkItemResult> {
        join_all(uploads.into_iter().map(|upload| async move {
            let name = upload.file_name.clone();
            match self.upload_and_analyze(client, upload).await {
                Ok(record) => BulkItemResult::success(name, Some(record)),
                Err(err) => BulkItemResult::failure(name, err),
            }
        }))
        .await
    }

    pub async fn reanalyze_many(&self, client: &ScopedClient, ids: &[Uuid]) -> Vec<BulkItemResult> {
        join_all(ids.iter().map(|&id| async move {
            match self.reanalyze(client, id).await {
                Ok(record) => BulkItemResult::success(id.to_string(), Some(record)),
                Err(err) => BulkItemResult::failure(id.to_string(), err),
            }
        }))
        .await
    }

    pub async fn list(&self, client: &ScopedClient) -> CaptionResult<Vec<UploadedFile>> {
        Ok(client.records.list().await?)
    }

    /// Returns the stored row as-is; the signed URL is not refreshed here.
    pub async fn get(&self, client: &ScopedClient, id: Uuid) -> CaptionResult<UploadedFile> {
        Ok(client.records.get(id).await?)
    }

    /// Remove the object, then the row. If the row delete fails the object is
    /// already gone and the row dangles.
    pub async fn delete(&self, client: &ScopedClient, id: Uuid) -> CaptionResult<()> {
        let record = client.records.get(id).await?;
        client.storage.delete(&record.path).await?;
        client.records.delete(id).await?;
        info!("deleted {} for user {}", record.path, client.identity);
        Ok(())
    }

    pub async fn delete_many(&self, client: &ScopedClient, ids: &[Uuid]) -> Vec<BulkItemResult> {
        let visible = match client.records.get_many(ids).await {
            Ok(rows) => rows,
            Err(err) => return fail_all(ids, &err),
        };
        let visible_ids: Vec<Uuid> = visible.iter().map(|row| row.id).collect();
        let paths: Vec<String> = visible.into_iter().map(|row| row.path).collect();

        if let Err(err) = client.storage.delete_many(&paths).await {
            return fail_all(ids, &err);
        }
        if let Err(err) = client.records.delete_many(&visible_ids).await {
            warn!(
                "{} object(s) removed but their rows remain: {}",
                paths.len(),
                err
            );
            return fail_all(ids, &err);
        }
        info!("deleted {} file(s) for user {}", paths.len(), client.identity);

        let deleted: HashSet<Uuid> = visible_ids.into_iter().collect();
        ids.iter()
            .map(|id| {
                if deleted.contains(id) {
                    BulkItemResult::success(id.to_string(), None)
                } else {
                    BulkItemResult::failure(id.to_string(), RecordError::AccessDenied(id.to_string()))
                }
            })
            .collect()
    }
}

fn fail_all(ids: &[Uuid], err: &dyn std::error::Error) -> Vec<BulkItemResult> {
    ids.iter()
        .map(|id| BulkItemResult::failure(id.to_string(), err))
        .collect()
}

/// File extension for an accepted image MIME type.
fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        other if other.starts_with("image/") => Some("bin"),
        _ => None,
    }
}
