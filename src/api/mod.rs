//! Call-recording HTTP API.
//!
//! Upload, history and download endpoints backed by the call-record store
//! and the recording directory. Mounted beside `/health`; it never talks to
//! the signaling registry.

pub mod handlers;
pub mod recordings;

use actix_web::web;

pub use recordings::{RecordingStore, StagedRecording};

/// Register the `/api` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/upload", web::post().to(handlers::upload))
            .route("/history", web::get().to(handlers::history))
            .route("/downloads/{file}", web::get().to(handlers::download)),
    );
}
