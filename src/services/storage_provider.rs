//! Storage abstraction for uploaded images.
//!
//! Objects live in a private bucket, so every URL handed out is a signed,
//! time-limited one. Callers must not assume a URL stays valid.

use crate::models::uploaded_file::{SignedUrl, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

const MAX_OBJECT_PATH_LEN: usize = 1024;

/// All provider faults collapse into `Provider`; transient and permanent
/// failures are not told apart and nothing is retried.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage provider error: {0}")]
    Provider(String),
    #[error("invalid object path `{0}`")]
    InvalidPath(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub content_type: String,
    /// Overwrite an existing object at the same path.
    pub upsert: bool,
    pub cache_control: Option<String>,
}

impl UploadOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            upsert: false,
            cache_control: None,
        }
    }
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store `bytes` at `path` and return a freshly signed URL for it.
    async fn upload(
        &self,
        bytes: Bytes,
        path: &str,
        options: &UploadOptions,
    ) -> StorageResult<StoredObject>;

    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Remove every path in one request. An empty slice is a no-op.
    async fn delete_many(&self, paths: &[String]) -> StorageResult<()>;

    /// Issue a new signed URL for an existing object.
    async fn url_for(&self, path: &str) -> StorageResult<SignedUrl>;

    /// Returns `false` both when the object is absent and when the check
    /// itself failed; a `false` is not proof of absence.
    async fn exists(&self, path: &str) -> bool;
}

/// Reject paths that could escape the bucket or confuse the provider.
pub fn ensure_path_safe(path: &str) -> StorageResult<()> {
    let invalid = path.is_empty()
        || path.len() > MAX_OBJECT_PATH_LEN
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains("..")
        || path.contains("//")
        || path.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Split `dir/sub/name.png` into (`dir/sub`, `name.png`). Top-level objects
/// have an empty directory.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    }
}
