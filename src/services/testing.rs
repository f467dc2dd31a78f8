//! In-memory doubles for storage, the vision endpoint and the RLS-protected
//! table. Test-only.

use crate::{
    config::{AppConfig, Args},
    middleware::auth::{AuthContext, JwtVerifier},
    models::uploaded_file::{ImageAnalysis, NewUploadedFile, SignedUrl, StoredObject, UploadedFile},
    services::{
        caption_service::{CaptionService, ImageUpload},
        file_records::{FileRecordStore, RecordError, RecordResult},
        scoped_client::{ClientFactory, ScopedClient, ScopedClientError},
        storage_provider::{
            StorageError, StorageProvider, StorageResult, UploadOptions, ensure_path_safe,
        },
        vision::{VisionClient, VisionError},
    },
    state::AppState,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test-jwt-secret";

/// Bytes that make the vision double fail.
pub const VISION_FAILURE_MARKER: &[u8] = b"FAIL";

pub fn test_config() -> AppConfig {
    let env: HashMap<&str, &str> = HashMap::from([
        ("SUPABASE_URL", "http://127.0.0.1:1"),
        ("SUPABASE_ANON_KEY", "anon"),
        ("SUPABASE_JWT_SECRET", TEST_JWT_SECRET),
        ("VISION_API_KEY", "sk-test"),
        ("MAX_UPLOAD_BYTES", "1024"),
    ]);
    AppConfig::from_sources(Args::default(), |key| env.get(key).map(|v| v.to_string()))
        .expect("test config")
}

pub fn image(file_name: &str, bytes: &'static [u8]) -> ImageUpload {
    ImageUpload {
        file_name: file_name.to_string(),
        content_type: "image/png".into(),
        bytes: Bytes::from_static(bytes),
    }
}

/// Objects plus the set of signed URLs that currently resolve.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Bytes>>,
    live_urls: Mutex<HashMap<String, String>>,
    counter: AtomicU64,
}

impl MemoryBackend {
    fn issue(&self, path: &str) -> SignedUrl {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let url = format!("memory://images/{}?token={}", path, n);
        self.live_urls
            .lock()
            .unwrap()
            .insert(url.clone(), path.to_string());
        SignedUrl {
            url,
            expires_at: Utc::now() + Duration::days(365),
        }
    }

    /// Dereference a signed URL the way an HTTP client would.
    pub fn read(&self, url: &str) -> Option<Bytes> {
        let path = self.live_urls.lock().unwrap().get(url).cloned()?;
        self.objects.lock().unwrap().get(&path).cloned()
    }

    /// Let every issued URL lapse.
    pub fn expire_urls(&self) {
        self.live_urls.lock().unwrap().clear();
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

pub struct MemoryStorage {
    backend: Arc<MemoryBackend>,
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn upload(
        &self,
        bytes: Bytes,
        path: &str,
        options: &UploadOptions,
    ) -> StorageResult<StoredObject> {
        ensure_path_safe(path)?;
        {
            let mut objects = self.backend.objects.lock().unwrap();
            if objects.contains_key(path) && !options.upsert {
                return Err(StorageError::Provider("The resource already exists".into()));
            }
            objects.insert(path.to_string(), bytes);
        }
        Ok(StoredObject {
            path: path.to_string(),
            url: self.backend.issue(path),
        })
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.delete_many(&[path.to_string()]).await
    }

    async fn delete_many(&self, paths: &[String]) -> StorageResult<()> {
        let mut objects = self.backend.objects.lock().unwrap();
        for path in paths {
            objects.remove(path);
        }
        self.backend
            .live_urls
            .lock()
            .unwrap()
            .retain(|_, path| !paths.contains(path));
        Ok(())
    }

    async fn url_for(&self, path: &str) -> StorageResult<SignedUrl> {
        ensure_path_safe(path)?;
        if !self.backend.objects.lock().unwrap().contains_key(path) {
            return Err(StorageError::Provider("Object not found".into()));
        }
        Ok(self.backend.issue(path))
    }

    async fn exists(&self, path: &str) -> bool {
        self.backend.objects.lock().unwrap().contains_key(path)
    }
}

/// Accepts only URLs that currently resolve in the backend.
pub struct MemoryVision {
    backend: Arc<MemoryBackend>,
}

#[async_trait]
impl VisionClient for MemoryVision {
    async fn describe(&self, image_url: &str) -> Result<ImageAnalysis, VisionError> {
        let bytes = self.backend.read(image_url).ok_or_else(|| VisionError::Rejected {
            status: 400,
            message: "Error while downloading image".into(),
        })?;
        if bytes.as_ref() == VISION_FAILURE_MARKER {
            return Err(VisionError::Rejected {
                status: 500,
                message: "model failure".into(),
            });
        }
        Ok(ImageAnalysis {
            caption: format!("an image of {} bytes", bytes.len()),
            tags: vec!["test".into()],
            model: "memory-vision".into(),
        })
    }
}

/// Table double that applies the ownership policy like RLS would.
pub struct MemoryRecords {
    identity: Uuid,
    table: Arc<Mutex<Vec<UploadedFile>>>,
}

impl MemoryRecords {
    fn visible(&self, row: &UploadedFile) -> bool {
        row.user_id == self.identity
    }
}

#[async_trait]
impl FileRecordStore for MemoryRecords {
    async fn insert(&self, new_file: NewUploadedFile) -> RecordResult<UploadedFile> {
        if new_file.user_id != self.identity {
            return Err(RecordError::AccessDenied(
                "new row violates row-level security policy".into(),
            ));
        }
        let now = Utc::now();
        let row = UploadedFile {
            id: Uuid::new_v4(),
            user_id: new_file.user_id,
            path: new_file.path,
            file_name: new_file.file_name,
            content_type: new_file.content_type,
            size_bytes: new_file.size_bytes,
            signed_url: new_file.signed_url.url,
            url_expires_at: new_file.signed_url.expires_at,
            caption: Some(new_file.analysis.caption),
            tags: new_file.analysis.tags,
            analysis_model: Some(new_file.analysis.model),
            analyzed_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        self.table.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> RecordResult<UploadedFile> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id && self.visible(row))
            .cloned()
            .ok_or_else(|| RecordError::AccessDenied(id.to_string()))
    }

    async fn get_many(&self, ids: &[Uuid]) -> RecordResult<Vec<UploadedFile>> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .iter()
            .filter(|row| ids.contains(&row.id) && self.visible(row))
            .cloned()
            .collect())
    }

    async fn list(&self) -> RecordResult<Vec<UploadedFile>> {
        let mut rows: Vec<UploadedFile> = self
            .table
            .lock()
            .unwrap()
            .iter()
            .filter(|row| self.visible(row))
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows)
    }

    async fn update_analysis(
        &self,
        id: Uuid,
        url: &SignedUrl,
        analysis: &ImageAnalysis,
    ) -> RecordResult<UploadedFile> {
        let mut table = self.table.lock().unwrap();
        let row = table
            .iter_mut()
            .find(|row| row.id == id && row.user_id == self.identity)
            .ok_or_else(|| RecordError::AccessDenied(id.to_string()))?;
        let now = Utc::now();
        row.signed_url = url.url.clone();
        row.url_expires_at = url.expires_at;
        row.caption = Some(analysis.caption.clone());
        row.tags = analysis.tags.clone();
        row.analysis_model = Some(analysis.model.clone());
        row.analyzed_at = Some(now);
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn delete(&self, id: Uuid) -> RecordResult<()> {
        if self.delete_many(&[id]).await? == 0 {
            return Err(RecordError::AccessDenied(id.to_string()));
        }
        Ok(())
    }

    async fn delete_many(&self, ids: &[Uuid]) -> RecordResult<u64> {
        let mut table = self.table.lock().unwrap();
        let before = table.len();
        table.retain(|row| !(ids.contains(&row.id) && row.user_id == self.identity));
        Ok((before - table.len()) as u64)
    }
}

/// Shared doubles; every scoped client built from it sees the same bucket and
/// table, filtered by its own identity.
#[derive(Clone)]
pub struct MemoryWorld {
    pub backend: Arc<MemoryBackend>,
    pub table: Arc<Mutex<Vec<UploadedFile>>>,
    pub vision: Arc<MemoryVision>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        let backend = Arc::new(MemoryBackend::default());
        Self {
            vision: Arc::new(MemoryVision {
                backend: backend.clone(),
            }),
            backend,
            table: Arc::default(),
        }
    }

    pub fn scoped(&self, identity: Uuid) -> ScopedClient {
        ScopedClient {
            identity,
            storage: Box::new(MemoryStorage {
                backend: self.backend.clone(),
            }),
            records: Box::new(MemoryRecords {
                identity,
                table: self.table.clone(),
            }),
        }
    }

    /// Client for a brand-new identity.
    pub fn client(&self) -> ScopedClient {
        self.scoped(Uuid::new_v4())
    }

    pub fn service(&self) -> CaptionService {
        CaptionService::new(self.vision.clone())
    }

    pub fn app_state(&self) -> AppState {
        self.app_state_with(test_config())
    }

    pub fn app_state_with(&self, config: AppConfig) -> AppState {
        let config = Arc::new(config);
        AppState {
            http: reqwest::Client::new(),
            verifier: Arc::new(JwtVerifier::new(&config.supabase.jwt_secret)),
            clients: Arc::new(self.clone()),
            captions: Arc::new(self.service()),
            config,
        }
    }
}

impl ClientFactory for MemoryWorld {
    fn client_for(&self, auth: &AuthContext) -> Result<ScopedClient, ScopedClientError> {
        if auth.token.is_blank() {
            return Err(ScopedClientError::MissingCredential);
        }
        Ok(self.scoped(auth.user_id))
    }
}
