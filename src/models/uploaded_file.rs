//! Represents an uploaded image and the analysis attached to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted upload, owned by exactly one user.
///
/// Rows are only ever read or written through a request-scoped client, so the
/// database row-level security policy decides which rows are visible.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct UploadedFile {
    /// Primary key.
    pub id: Uuid,

    /// Owning identity (the `sub` claim of the caller's token).
    pub user_id: Uuid,

    /// Object key within the storage bucket, e.g. `{user_id}/{uuid}.png`.
    pub path: String,

    /// File name as supplied by the client.
    pub file_name: String,

    /// MIME type of the stored object.
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Last signed URL issued for `path`.
    pub signed_url: String,

    /// When `signed_url` stops working.
    pub url_expires_at: DateTime<Utc>,

    /// Generated caption.
    pub caption: Option<String>,

    /// Generated tags.
    pub tags: Vec<String>,

    /// Model that produced the current analysis.
    pub analysis_model: Option<String>,

    pub analyzed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadedFile {
    /// Whether the stored signed URL has lapsed at `now`.
    pub fn url_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.url_expires_at
    }
}

/// Values needed to insert a new row.
#[derive(Clone, Debug)]
pub struct NewUploadedFile {
    pub user_id: Uuid,
    pub path: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub signed_url: SignedUrl,
    pub analysis: ImageAnalysis,
}

/// A time-limited URL granting read access to a private object.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of an upload: where the object lives and how to read it.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub path: String,
    pub url: SignedUrl,
}

/// Caption and tags produced by the vision model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageAnalysis {
    pub caption: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Model identifier; filled in by the client, not the model reply.
    #[serde(default)]
    pub model: String,
}

/// One outcome of a bulk operation; items succeed or fail independently.
#[derive(Serialize, Debug)]
pub struct BulkItemResult {
    /// File name for uploads, record id for id-based operations.
    pub item: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<UploadedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn success(item: impl Into<String>, file: Option<UploadedFile>) -> Self {
        Self {
            item: item.into(),
            ok: true,
            file,
            error: None,
        }
    }

    pub fn failure(item: impl Into<String>, error: impl ToString) -> Self {
        Self {
            item: item.into(),
            ok: false,
            file: None,
            error: Some(error.to_string()),
        }
    }
}
