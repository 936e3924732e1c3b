use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails (refused, reset, DNS)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpClientError {
    pub fn timeout(duration: Duration) -> Self {
        HttpClientError::Timeout(duration.as_millis() as u64)
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send, with an absolute upstream URI
    ///
    /// # Returns
    /// A future that resolves to the backend's response or an error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Issue a health probe (`GET url`) bounded by `timeout`
    ///
    /// # Returns
    /// The status code the backend answered with. Transport failures and
    /// timeouts are errors.
    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
