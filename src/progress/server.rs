use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::db::{DbHandle, ProgressDb};
use super::service::TaskService;
use super::ws::{self, EventBroadcaster};
use crate::config::{TabsSection, TaskpulseConfig, WebSocketSection};

/// Configuration for the progress server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
    pub websocket: WebSocketSection,
    pub tabs: TabsSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&TaskpulseConfig::default())
    }
}

impl From<&TaskpulseConfig> for ServerConfig {
    fn from(config: &TaskpulseConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.database.path.clone(),
            dev_mode: config.server.dev_mode,
            websocket: config.websocket.clone(),
            tabs: config.tabs.clone(),
        }
    }
}

/// Build the shared state for an already-opened database.
pub fn build_state(db: ProgressDb, websocket: WebSocketSection, tabs: TabsSection) -> Arc<AppState> {
    let broadcaster = EventBroadcaster::new(websocket.channel_capacity);
    Arc::new(AppState {
        service: TaskService::new(DbHandle::new(db), broadcaster, tabs),
        websocket,
    })
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the progress server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let db = ProgressDb::new(&config.db_path).context("Failed to initialize progress database")?;
    let state = build_state(db, config.websocket.clone(), config.tabs.clone());

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        %local_addr,
        db = %config.db_path.display(),
        dev_mode = config.dev_mode,
        "taskpulse listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = ProgressDb::new_in_memory().unwrap();
        build_router(build_state(
            db,
            WebSocketSection::default(),
            TabsSection::default(),
        ))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_create_company_via_full_router() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/companies")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "server-test", "is_demo": true}).to_string(),
            ))
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let company: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(company["name"], "server-test");
        assert_eq!(company["is_demo"], true);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3141);
        assert_eq!(
            config.db_path,
            std::path::PathBuf::from(".taskpulse/taskpulse.db")
        );
        assert!(!config.dev_mode);
        assert_eq!(config.websocket.ping_interval_secs, 30);
    }
}
