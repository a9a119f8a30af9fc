use async_trait::async_trait;
use thiserror::Error;

use crate::core::exchange::{Request, Response};

/// Custom error type for HTTP client operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request to an absolute destination URL
    ///
    /// # Arguments
    /// * `request` - Method, headers and body to forward
    /// * `destination` - Absolute URL including path and query
    ///
    /// # Returns
    /// A future that resolves to the backend's fully buffered response or an error
    async fn send(&self, request: &Request, destination: &str) -> HttpClientResult<Response>;

    /// Perform a health check on a backend
    ///
    /// # Arguments
    /// * `url` - The URL to check
    /// * `timeout_secs` - Timeout in seconds
    ///
    /// # Returns
    /// A future that resolves to true if the backend is healthy, false otherwise
    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool>;
}
