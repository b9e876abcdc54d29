//! Error types shared across the pipeline, plus the handler-side `LogErr` helper.

use axum::http::StatusCode;
use reqwest::StatusCode as HttpStatus;
use thiserror::Error;

/// Download failure at the fetcher boundary. A failed transfer never yields
/// partial bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to download image {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to download image {url}: server returned {status}")]
    Status { url: String, status: HttpStatus },
    #[error("Failed to download image {url}: received {received} of {expected} bytes")]
    Truncated {
        url: String,
        expected: u64,
        received: usize,
    },
    #[error("Failed to download image {url}: empty response body")]
    Empty { url: String },
}

/// Any failure of a classification call. All variants are retried by the
/// orchestrator.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model returned {status}: {body}")]
    Status { status: HttpStatus, body: String },
    #[error("prompt blocked by the model: {0}")]
    Blocked(String),
    #[error("model response contained no text")]
    EmptyResponse,
}

/// Failures of the review plumbing around the moderation core.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("No image URL found for image_id={0}")]
    MissingUrl(i64),
    #[error("Image record {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("Review batch task failed: {0}")]
    Batch(#[from] tokio::task::JoinError),
}

/// Extension trait for logging errors and converting to StatusCode
pub trait LogErr<T> {
    /// Log error with context and return INTERNAL_SERVER_ERROR
    fn log_500(self, context: &str) -> Result<T, StatusCode>;

    /// Log error with context and return a custom StatusCode
    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.log_status(context, StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode> {
        self.map_err(|e| {
            tracing::error!("{}: {}", context, e);
            status
        })
    }
}
