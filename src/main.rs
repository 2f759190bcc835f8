use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use signal_relay::config::CorsConfig;
use signal_relay::{api, health_check, index, AppError, AppState, DbOperations, Settings, WebSocketServer};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors_config = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allowed_methods(vec!["GET", "POST"])
    };

    cors_config.max_age(config.max_age as usize)
}

#[tokio::main]
async fn main() -> signal_relay::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    let store = DbOperations::connect(
        &config.storage.database_url,
        config.storage.max_connections,
        Duration::from_secs(config.storage.acquire_timeout_secs),
    )
    .await?;

    // Start the registry; both listeners share it
    let state = AppState::new(config.clone(), store);
    info!(dir = %state.recordings.dir().display(), "Recordings directory");

    let listener = TcpListener::bind((config.signaling.host.as_str(), config.signaling.port)).await?;
    let signaling = Arc::new(WebSocketServer::new(
        state.registry.clone(),
        config.signaling.server_options(),
    ));
    tokio::spawn(signaling.run(listener));

    info!("Starting HTTP server at {}:{}", config.server.host, config.server.port);

    let state = web::Data::new(state);
    let cors_settings = config.cors.clone();

    HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_settings))
            .app_data(state.clone())
            .route("/", web::get().to(index))
            .route("/health", web::get().to(health_check))
            .configure(api::configure)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
