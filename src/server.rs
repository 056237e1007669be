use axum::{
    extract::State,
    http::Method,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    database::{sessions::SqliteSessionStore, DbPool},
    error::Result,
    logs::{websocket::session_logs_handler, LogBroadcaster},
    orchestrator::Orchestrator,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub orchestrator: Arc<Orchestrator>,
    pub logs: LogBroadcaster,
}

impl AppState {
    pub fn new(config: Config, db: DbPool) -> Self {
        let logs = LogBroadcaster::new();
        let store = Arc::new(SqliteSessionStore::new(db.clone()));
        let orchestrator = Arc::new(Orchestrator::new(config.clone(), store, logs.clone()));
        Self {
            config,
            db,
            orchestrator,
            logs,
        }
    }
}

/// Routes and middleware, without binding a listener
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::CACHE_CONTROL,
        ])
        .allow_origin(axum::http::header::HeaderValue::from_static("*"));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/logs/:session_id", get(session_logs_handler))
        .nest("/api", crate::api::create_api_router())
        .layer(RequestBodyLimitLayer::new(state.config.upload_limit_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let db = crate::database::create_pool(&config.database_url()).await?;
    let state = AppState::new(config.clone(), db.clone());

    match state.orchestrator.cleanup_stale_uploads().await {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} stale upload directories", removed),
        Err(e) => warn!("Stale upload cleanup failed: {}", e),
    }

    let app = build_router(state);

    let address = config.server_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Server listening on {}", address);
    info!("Live session logs at ws://{}/ws/logs/:session_id", address);

    match axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => error!("Server error: {}", e),
    }

    crate::database::close_pool(db).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions")
        .fetch_one(&state.db)
        .await
    {
        Ok(sessions) => json!({ "status": "connected", "sessions": sessions }),
        Err(e) => {
            error!("Database health check failed: {}", e);
            return Json(json!({
                "status": "unhealthy",
                "service": "vibe-migrate",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "error": "Database connection failed"
            }));
        }
    };

    Json(json!({
        "status": "healthy",
        "service": "vibe-migrate",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
        "repository": state.config.repository.path,
    }))
}
