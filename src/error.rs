use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use std::time::Duration;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] WebSocketError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Implement conversion from sqlx::Error
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.into())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::ValidationError(format!("Malformed multipart body: {}", err))
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

// Implement actix_web::ResponseError for AppError
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = self.to_string();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "message": message
            }
        });
        HttpResponse::build(status).json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::WebSocketError(WebSocketError::RegistryClosed) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failures scoped to a single signaling session.
///
/// None of these cross session boundaries: a session that hits a fatal
/// variant unregisters itself and closes its socket, nothing else.
#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    /// Not fatal. The frame is discarded and the session keeps reading.
    #[error("Invalid message format: {0}")]
    MalformedMessage(String),

    #[error("Read failed: {0}")]
    ReadFailure(String),

    #[error("No frame received within {0:?}")]
    IdleTimeout(Duration),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("Registry is not running")]
    RegistryClosed,
}

impl WebSocketError {
    /// Whether the session that produced this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WebSocketError::MalformedMessage(_))
    }
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::Configuration(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DatabaseError::ConnectionError(err.to_string())
            }
            _ => DatabaseError::QueryError(err.to_string()),
        }
    }
}
