//! Persistence for `uploaded_files` rows.
//!
//! Rows are read and written through Supabase's PostgREST endpoint
//! (`/rest/v1/uploaded_files`) with the caller's access token. PostgREST
//! verifies that token and runs each statement as the `authenticated` role with
//! the token's claims published in `request.jwt.claims`; the table's row-level
//! security policy then limits the handle to the caller's own rows. The service
//! holds no database credential of its own.

use crate::{
    config::SupabaseConfig,
    models::uploaded_file::{ImageAnalysis, NewUploadedFile, SignedUrl, UploadedFile},
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const TABLE: &str = "uploaded_files";

/// SQLSTATE raised when a row-level security `WITH CHECK` fails.
pub const INSUFFICIENT_PRIVILEGE: &str = "42501";

#[derive(Debug, Error)]
pub enum RecordError {
    /// The row does not exist or belongs to another identity; RLS makes the
    /// two indistinguishable.
    #[error("file `{0}` not found or not accessible")]
    AccessDenied(String),
    #[error("record store failure: {0}")]
    Backend(String),
}

impl RecordError {
    /// Classify a database error by SQLSTATE.
    pub fn from_code(code: Option<&str>, message: impl Into<String>) -> Self {
        match code {
            Some(INSUFFICIENT_PRIVILEGE) => RecordError::AccessDenied(message.into()),
            _ => RecordError::Backend(message.into()),
        }
    }
}

pub type RecordResult<T> = Result<T, RecordError>;

#[async_trait]
pub trait FileRecordStore: Send + Sync {
    async fn insert(&self, new_file: NewUploadedFile) -> RecordResult<UploadedFile>;

    async fn get(&self, id: Uuid) -> RecordResult<UploadedFile>;

    /// Only the rows visible to this handle's identity are returned; ids that
    /// are missing or foreign are silently absent.
    async fn get_many(&self, ids: &[Uuid]) -> RecordResult<Vec<UploadedFile>>;

    async fn list(&self) -> RecordResult<Vec<UploadedFile>>;

    /// Replace the signed URL and analysis fields of an existing row.
    async fn update_analysis(
        &self,
        id: Uuid,
        url: &SignedUrl,
        analysis: &ImageAnalysis,
    ) -> RecordResult<UploadedFile>;

    async fn delete(&self, id: Uuid) -> RecordResult<()>;

    /// Returns the number of rows removed.
    async fn delete_many(&self, ids: &[Uuid]) -> RecordResult<u64>;
}

/// PostgREST-backed store carrying one caller's access token.
pub struct PostgrestRecords {
    http: reqwest::Client,
    /// `{project url}/rest/v1/uploaded_files`
    table_url: String,
    anon_key: String,
    access_token: String,
}

#[derive(Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl PostgrestRecords {
    pub fn new(http: reqwest::Client, config: &SupabaseConfig, access_token: &str) -> Self {
        Self {
            http,
            table_url: format!("{}/rest/v1/{}", config.url.trim_end_matches('/'), TABLE),
            anon_key: config.anon_key.clone(),
            access_token: access_token.to_string(),
        }
    }

    fn request(&self, method: Method) -> RequestBuilder {
        self.http
            .request(method, &self.table_url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.access_token)
    }

    /// A request whose response body is the affected rows.
    fn returning(&self, method: Method) -> RequestBuilder {
        self.request(method).header("Prefer", "return=representation")
    }

    async fn rows<T: DeserializeOwned>(
        &self,
        op: &str,
        builder: RequestBuilder,
    ) -> RecordResult<Vec<T>> {
        let response = builder
            .send()
            .await
            .map_err(|err| RecordError::Backend(format!("{} failed: {}", op, err)))?;
        if !response.status().is_success() {
            return Err(postgrest_error(op, response).await);
        }
        response
            .json()
            .await
            .map_err(|err| RecordError::Backend(format!("{} returned bad body: {}", op, err)))
    }
}

/// PostgREST filter matching any of `ids`.
fn id_in(ids: &[Uuid]) -> String {
    let joined = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
    format!("in.({})", joined)
}

fn single(rows: Vec<UploadedFile>, id: Uuid) -> RecordResult<UploadedFile> {
    rows.into_iter()
        .next()
        .ok_or_else(|| RecordError::AccessDenied(id.to_string()))
}

async fn postgrest_error(op: &str, response: Response) -> RecordError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<PostgrestErrorBody>(&text) {
        Ok(body) => {
            let message = body.message.unwrap_or(text);
            debug!("{} rejected ({}): {:?} {}", op, status, body.code, message);
            RecordError::from_code(
                body.code.as_deref(),
                format!("{} failed ({}): {}", op, status, message),
            )
        }
        Err(_) => RecordError::Backend(format!("{} failed ({}): {}", op, status, text)),
    }
}

#[async_trait]
impl FileRecordStore for PostgrestRecords {
    async fn insert(&self, new_file: NewUploadedFile) -> RecordResult<UploadedFile> {
        let body = json!({
            "user_id": new_file.user_id,
            "path": new_file.path,
            "file_name": new_file.file_name,
            "content_type": new_file.content_type,
            "size_bytes": new_file.size_bytes,
            "signed_url": new_file.signed_url.url,
            "url_expires_at": new_file.signed_url.expires_at,
            "caption": new_file.analysis.caption,
            "tags": new_file.analysis.tags,
            "analysis_model": new_file.analysis.model,
            "analyzed_at": Utc::now(),
        });
        let rows = self
            .rows("insert", self.returning(Method::POST).json(&body))
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RecordError::Backend("insert returned no row".into()))
    }

    async fn get(&self, id: Uuid) -> RecordResult<UploadedFile> {
        let query = [("id", format!("eq.{}", id)), ("select", "*".into())];
        let rows = self
            .rows("get", self.request(Method::GET).query(&query))
            .await?;
        single(rows, id)
    }

    async fn get_many(&self, ids: &[Uuid]) -> RecordResult<Vec<UploadedFile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = [("id", id_in(ids)), ("select", "*".into())];
        self.rows("get_many", self.request(Method::GET).query(&query))
            .await
    }

    async fn list(&self) -> RecordResult<Vec<UploadedFile>> {
        let query = [("select", "*"), ("order", "created_at.desc,id.asc")];
        self.rows("list", self.request(Method::GET).query(&query))
            .await
    }

    async fn update_analysis(
        &self,
        id: Uuid,
        url: &SignedUrl,
        analysis: &ImageAnalysis,
    ) -> RecordResult<UploadedFile> {
        let now = Utc::now();
        let body = json!({
            "signed_url": url.url,
            "url_expires_at": url.expires_at,
            "caption": analysis.caption,
            "tags": analysis.tags,
            "analysis_model": analysis.model,
            "analyzed_at": now,
            "updated_at": now,
        });
        let query = [("id", format!("eq.{}", id))];
        let rows = self
            .rows(
                "update",
                self.returning(Method::PATCH).query(&query).json(&body),
            )
            .await?;
        single(rows, id)
    }

    async fn delete(&self, id: Uuid) -> RecordResult<()> {
        if self.delete_many(&[id]).await? == 0 {
            return Err(RecordError::AccessDenied(id.to_string()));
        }
        Ok(())
    }

    async fn delete_many(&self, ids: &[Uuid]) -> RecordResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let query = [("id", id_in(ids)), ("select", "id".into())];
        let removed: Vec<Value> = self
            .rows("delete", self.returning(Method::DELETE).query(&query))
            .await?;
        Ok(removed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SIGNED_URL_EXPIRY_SECS;
    use chrono::Duration;
    use mockito::{Matcher, Server};

    const TOKEN: &str = "caller-token";

    fn records(server: &Server) -> PostgrestRecords {
        let config = SupabaseConfig {
            url: server.url(),
            anon_key: "anon-key".into(),
            jwt_secret: "unused".into(),
            bucket: "images".into(),
            signed_url_expiry_secs: DEFAULT_SIGNED_URL_EXPIRY_SECS,
        };
        PostgrestRecords::new(reqwest::Client::new(), &config, TOKEN)
    }

    fn row(id: Uuid, user_id: Uuid) -> Value {
        json!({
            "id": id,
            "user_id": user_id,
            "path": format!("{}/{}.png", user_id, id),
            "file_name": "a.png",
            "content_type": "image/png",
            "size_bytes": 3,
            "signed_url": "https://project.test/storage/v1/object/sign/images/a.png?token=1",
            "url_expires_at": "2027-01-01T00:00:00+00:00",
            "caption": "a cat",
            "tags": ["cat"],
            "analysis_model": "vision-model",
            "analyzed_at": "2026-01-01T00:00:00.123456+00:00",
            "created_at": "2026-01-01T00:00:00.123456+00:00",
            "updated_at": "2026-01-01T00:00:00.123456+00:00"
        })
    }

    fn new_file(user_id: Uuid) -> NewUploadedFile {
        NewUploadedFile {
            user_id,
            path: format!("{}/x.png", user_id),
            file_name: "x.png".into(),
            content_type: "image/png".into(),
            size_bytes: 3,
            signed_url: SignedUrl {
                url: "https://project.test/signed".into(),
                expires_at: Utc::now() + Duration::days(365),
            },
            analysis: ImageAnalysis {
                caption: "a cat".into(),
                tags: vec!["cat".into()],
                model: "vision-model".into(),
            },
        }
    }

    #[tokio::test]
    async fn insert_sends_caller_token_and_returns_row() {
        let mut server = Server::new_async().await;
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();
        let mock = server
            .mock("POST", "/rest/v1/uploaded_files")
            .match_header("apikey", "anon-key")
            .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
            .match_header("prefer", "return=representation")
            .match_body(Matcher::PartialJson(json!({
                "user_id": user,
                "file_name": "x.png",
                "tags": ["cat"],
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(json!([row(id, user)]).to_string())
            .create_async()
            .await;

        let stored = records(&server).insert(new_file(user)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(stored.id, id);
        assert_eq!(stored.user_id, user);
        assert_eq!(stored.tags, vec!["cat"]);
    }

    #[tokio::test]
    async fn policy_violation_maps_to_access_denied() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/rest/v1/uploaded_files")
            .with_status(403)
            .with_body(
                r#"{"code":"42501","details":null,"hint":null,"message":"new row violates row-level security policy for table \"uploaded_files\""}"#,
            )
            .create_async()
            .await;

        let err = records(&server)
            .insert(new_file(Uuid::new_v4()))
            .await
            .unwrap_err();

        assert!(matches!(err, RecordError::AccessDenied(_)), "{err:?}");
    }

    #[tokio::test]
    async fn other_postgrest_errors_are_backend_faults() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/rest/v1/uploaded_files")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":"PGRST100","message":"failed to parse filter"}"#)
            .create_async()
            .await;

        let err = records(&server).list().await.unwrap_err();

        match err {
            RecordError::Backend(message) => assert!(message.contains("failed to parse filter")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn invisible_row_is_access_denied() {
        let mut server = Server::new_async().await;
        let id = Uuid::new_v4();
        server
            .mock("GET", "/rest/v1/uploaded_files")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("id".into(), format!("eq.{}", id)),
                Matcher::UrlEncoded("select".into(), "*".into()),
            ]))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let err = records(&server).get(id).await.unwrap_err();

        assert!(matches!(err, RecordError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn update_with_no_visible_row_is_access_denied() {
        let mut server = Server::new_async().await;
        let id = Uuid::new_v4();
        let mock = server
            .mock("PATCH", "/rest/v1/uploaded_files")
            .match_query(Matcher::UrlEncoded("id".into(), format!("eq.{}", id)))
            .match_body(Matcher::PartialJson(json!({ "caption": "a dog" })))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let url = SignedUrl {
            url: "https://project.test/fresh".into(),
            expires_at: Utc::now() + Duration::days(365),
        };
        let analysis = ImageAnalysis {
            caption: "a dog".into(),
            tags: Vec::new(),
            model: "vision-model".into(),
        };

        let err = records(&server)
            .update_analysis(id, &url, &analysis)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, RecordError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn delete_many_counts_removed_rows() {
        let mut server = Server::new_async().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mock = server
            .mock("DELETE", "/rest/v1/uploaded_files")
            .match_query(Matcher::UrlEncoded("id".into(), format!("in.({},{})", a, b)))
            .with_status(200)
            .with_body(json!([{ "id": a }]).to_string())
            .create_async()
            .await;

        let removed = records(&server).delete_many(&[a, b]).await.unwrap();

        mock.assert_async().await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn empty_id_lists_make_no_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let records = records(&server);
        assert!(records.get_many(&[]).await.unwrap().is_empty());
        assert_eq!(records.delete_many(&[]).await.unwrap(), 0);

        mock.assert_async().await;
    }
}
