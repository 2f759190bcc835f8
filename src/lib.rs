pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod websocket;

use std::sync::Arc;
use actix_web::{web, HttpResponse};

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use api::RecordingStore;
pub use db::DbOperations;

pub use websocket::{CollisionPolicy, Registry, RegistryHandle, WebSocketServer};

/// Plain-text liveness line for load balancers
pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body("signal-relay running")
}

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and the number of connected peers
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let users = state.registry.connected_users().await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connected_users": users.len(),
    })))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: RegistryHandle,
    pub store: DbOperations,
    pub recordings: RecordingStore,
}

impl AppState {
    /// Start the registry task and wrap its handle next to the call-record store.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Settings, store: DbOperations) -> Self {
        let registry = Registry::new(config.signaling.collision_policy)
            .spawn(config.signaling.registry_intake_capacity);
        let recordings = RecordingStore::new(
            config.storage.upload_dir.clone(),
            config.storage.max_upload_bytes,
        );

        Self {
            config: Arc::new(config),
            registry,
            store,
            recordings,
        }
    }
}
