//! Application state shared across handlers.
//!
//! Everything here is immutable or a connection pool. Per-caller handles are
//! built from `clients` inside each request; `http` itself carries no
//! credential.

use crate::{
    config::AppConfig,
    middleware::auth::JwtVerifier,
    services::{caption_service::CaptionService, scoped_client::ClientFactory},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Shared HTTP pool, used directly only by the readiness check.
    pub http: reqwest::Client,
    pub verifier: Arc<JwtVerifier>,
    pub clients: Arc<dyn ClientFactory>,
    pub captions: Arc<CaptionService>,
}
