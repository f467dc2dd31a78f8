//! Supabase Storage implementation of [`StorageProvider`].
//!
//! Talks to the Storage REST API (`/storage/v1/...`) with the caller's access
//! token, so the bucket's own policies apply to every request. One instance is
//! built per request by the scoped client factory and must not outlive it.

use crate::{
    config::SupabaseConfig,
    models::uploaded_file::{SignedUrl, StoredObject},
    services::storage_provider::{
        StorageError, StorageProvider, StorageResult, UploadOptions, ensure_path_safe, split_path,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use reqwest::{Method, RequestBuilder, Response, header};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const LIST_LIMIT: u32 = 100;

pub struct SupabaseStorage {
    http: reqwest::Client,
    /// `{project url}/storage/v1`
    api_base: String,
    bucket: String,
    anon_key: String,
    access_token: String,
    expiry_secs: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    message: Option<String>,
    error: Option<String>,
}

impl SupabaseStorage {
    pub fn new(http: reqwest::Client, config: &SupabaseConfig, access_token: &str) -> Self {
        Self {
            http,
            api_base: format!("{}/storage/v1", config.url.trim_end_matches('/')),
            bucket: config.bucket.clone(),
            anon_key: config.anon_key.clone(),
            access_token: access_token.to_string(),
            expiry_secs: config.signed_url_expiry_secs,
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.access_token)
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/object/{}/{}", self.api_base, self.bucket, path)
    }

    async fn send(&self, op: &str, builder: RequestBuilder) -> StorageResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|err| StorageError::Provider(format!("{} failed: {}", op, err)))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(provider_error(op, response).await)
        }
    }

    async fn list_names(&self, dir: &str, search: &str) -> StorageResult<Vec<String>> {
        let url = format!("{}/object/list/{}", self.api_base, self.bucket);
        let body = json!({
            "prefix": dir,
            "search": search,
            "limit": LIST_LIMIT,
            "offset": 0,
            "sortBy": { "column": "name", "order": "asc" },
        });
        let response = self
            .send("list", self.request(Method::POST, url).json(&body))
            .await?;
        let entries: Vec<ListEntry> = response
            .json()
            .await
            .map_err(|err| StorageError::Provider(format!("list returned bad body: {}", err)))?;
        Ok(entries.into_iter().map(|entry| entry.name).collect())
    }
}

#[async_trait]
impl StorageProvider for SupabaseStorage {
    async fn upload(
        &self,
        bytes: Bytes,
        path: &str,
        options: &UploadOptions,
    ) -> StorageResult<StoredObject> {
        ensure_path_safe(path)?;
        let size = bytes.len();
        let mut builder = self
            .request(Method::POST, self.object_url(path))
            .header(header::CONTENT_TYPE, &options.content_type)
            .header("x-upsert", if options.upsert { "true" } else { "false" })
            .body(bytes);
        if let Some(cache_control) = &options.cache_control {
            builder = builder.header(header::CACHE_CONTROL, cache_control);
        }
        self.send("upload", builder).await?;
        debug!("uploaded {} bytes to {}/{}", size, self.bucket, path);

        // Private bucket: hand back a signed URL, never a public one.
        let url = self.url_for(path).await?;
        Ok(StoredObject {
            path: path.to_string(),
            url,
        })
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.delete_many(&[path.to_string()]).await
    }

    async fn delete_many(&self, paths: &[String]) -> StorageResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        for path in paths {
            ensure_path_safe(path)?;
        }
        let url = format!("{}/object/{}", self.api_base, self.bucket);
        self.send(
            "delete",
            self.request(Method::DELETE, url)
                .json(&json!({ "prefixes": paths })),
        )
        .await?;
        debug!("deleted {} object(s) from {}", paths.len(), self.bucket);
        Ok(())
    }

    async fn url_for(&self, path: &str) -> StorageResult<SignedUrl> {
        ensure_path_safe(path)?;
        let issued_at = Utc::now();
        let url = format!("{}/object/sign/{}/{}", self.api_base, self.bucket, path);
        let response = self
            .send(
                "sign",
                self.request(Method::POST, url)
                    .json(&json!({ "expiresIn": self.expiry_secs })),
            )
            .await?;
        let signed: SignResponse = response
            .json()
            .await
            .map_err(|err| StorageError::Provider(format!("sign returned bad body: {}", err)))?;

        // The API answers with a path relative to `/storage/v1`.
        let url = if signed.signed_url.starts_with("http") {
            signed.signed_url
        } else {
            format!("{}{}", self.api_base, signed.signed_url)
        };
        // expiry_secs is capped at ten years by AppConfig.
        let expires_at = issued_at + Duration::seconds(self.expiry_secs as i64);
        Ok(SignedUrl { url, expires_at })
    }

    async fn exists(&self, path: &str) -> bool {
        if ensure_path_safe(path).is_err() {
            return false;
        }
        let (dir, name) = split_path(path);
        match self.list_names(dir, name).await {
            Ok(names) => names.iter().any(|candidate| candidate == name),
            Err(err) => {
                warn!("existence check for {} failed, reporting absent: {}", path, err);
                false
            }
        }
    }
}

async fn provider_error(op: &str, response: Response) -> StorageError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ProviderErrorBody>(&text)
        .ok()
        .and_then(|body| body.message.or(body.error))
        .unwrap_or(text);
    StorageError::Provider(format!("{} failed ({}): {}", op, status, message))
}
