//! Request-scoped client construction.
//!
//! A [`ScopedClient`] carries one caller's credential into storage and the
//! database. Handlers build one per request and drop it when the request ends;
//! it is never cached or shared across identities.

use crate::{
    config::AppConfig,
    middleware::auth::AuthContext,
    services::{
        file_records::{FileRecordStore, PostgrestRecords},
        storage_provider::StorageProvider,
        supabase_storage::SupabaseStorage,
    },
};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScopedClientError {
    #[error("a bearer token is required for this operation")]
    MissingCredential,
}

/// Storage and database handles bound to a single caller.
pub struct ScopedClient {
    pub identity: Uuid,
    pub storage: Box<dyn StorageProvider>,
    pub records: Box<dyn FileRecordStore>,
}

pub trait ClientFactory: Send + Sync {
    fn client_for(&self, auth: &AuthContext) -> Result<ScopedClient, ScopedClientError>;
}

/// Builds Supabase Storage and PostgREST handles over one HTTP pool.
///
/// Only immutable configuration and the connection pool are shared; the
/// caller's token is attached to each handle and is the only credential
/// either of them sends.
pub struct SupabaseClientFactory {
    config: Arc<AppConfig>,
    http: reqwest::Client,
}

impl SupabaseClientFactory {
    pub fn new(config: Arc<AppConfig>, http: reqwest::Client) -> Self {
        Self { config, http }
    }
}

impl ClientFactory for SupabaseClientFactory {
    fn client_for(&self, auth: &AuthContext) -> Result<ScopedClient, ScopedClientError> {
        if auth.token.is_blank() {
            return Err(ScopedClientError::MissingCredential);
        }
        Ok(ScopedClient {
            identity: auth.user_id,
            storage: Box::new(SupabaseStorage::new(
                self.http.clone(),
                &self.config.supabase,
                auth.token.as_str(),
            )),
            records: Box::new(PostgrestRecords::new(
                self.http.clone(),
                &self.config.supabase,
                auth.token.as_str(),
            )),
        })
    }
}
