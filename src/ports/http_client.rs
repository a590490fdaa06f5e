use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No response headers within the allowed time
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request to an upstream instance.
    ///
    /// `timeout` bounds the wait for response headers; the body streams
    /// afterwards without a deadline so long-lived event streams work.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>>;

    /// Probe `url`; `Ok(true)` when it answers with a success status.
    async fn health_check(&self, url: &str, timeout: Duration) -> HttpClientResult<bool>;
}
