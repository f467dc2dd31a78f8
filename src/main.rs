use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::{io::ErrorKind, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use services::{
    caption_service::CaptionService, scoped_client::SupabaseClientFactory, vision::OpenAiVision,
};

const SUPABASE_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Environment + logging setup ---
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;
    let cfg = Arc::new(cfg);

    tracing::info!("Starting caption-service with config: {:?}", cfg);

    // --- Handle migration mode ---
    // Migrations run with the table owner's credential; serving never opens a
    // database connection.
    if migrate {
        let url = cfg
            .migration_database_url
            .as_deref()
            .context("migration database URL not configured")?;
        let db = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .context("connecting to Postgres")?;
        sqlx::migrate!("./migrations").run(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize services ---
    let http = reqwest::Client::builder()
        .timeout(SUPABASE_HTTP_TIMEOUT)
        .build()
        .context("building Supabase HTTP client")?;
    let vision = OpenAiVision::new(&cfg.vision)?;

    let app_state = state::AppState {
        config: cfg.clone(),
        http: http.clone(),
        verifier: Arc::new(middleware::auth::JwtVerifier::new(&cfg.supabase.jwt_secret)),
        clients: Arc::new(SupabaseClientFactory::new(cfg.clone(), http)),
        captions: Arc::new(CaptionService::new(Arc::new(vision))),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(app_state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
