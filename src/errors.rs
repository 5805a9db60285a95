use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("corrupt cache entry: {0}")]
    CorruptCacheEntry(String),
    #[error("geocoder failed: {0}")]
    Geocoder(String),
    #[error("knowledge lookup failed: {0}")]
    Knowledge(String),
    #[error("unexpected response structure from model: {0}")]
    MalformedModelResponse(String),
    #[error("model output is not valid JSON: {0}")]
    ModelJson(#[source] serde_json::Error),
    #[error("generative model is not initialized")]
    ModelNotInitialized,
    #[error("unexpected result type from model: expected {expected}, got {actual}")]
    UnexpectedModelShape {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Conflict(String),
}
