//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the Supabase REST gateway

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness check. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Sends the anonymous key to `{supabase}/rest/v1/`. HTTP 200 when the gateway
/// answers without a 5xx, 503 otherwise. Row and object access are not checked:
/// both need a caller credential.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let url = format!("{}/rest/v1/", state.config.supabase.url);
    let postgrest_check = match state
        .http
        .get(&url)
        .header("apikey", &state.config.supabase.anon_key)
        .send()
        .await
    {
        Ok(response) if !response.status().is_server_error() => CheckStatus {
            ok: true,
            error: None,
        },
        Ok(response) => CheckStatus {
            ok: false,
            error: Some(format!("unexpected status: {}", response.status())),
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(format!("error: {}", e)),
        },
    };

    let overall_ok = postgrest_check.ok;
    let mut checks = HashMap::new();
    checks.insert("postgrest", postgrest_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
