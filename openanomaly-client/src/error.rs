//! Error types for the OpenAnomaly client

use openanomaly_core::error::StoreError;
use thiserror::Error;

/// Result type alias for scheduler client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the scheduler API
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 400 && *status < 500)
    }

    /// Check if the scheduler could not be reached at all
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::RequestFailed(e) if e.is_connect() || e.is_timeout() || e.is_request())
    }
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ApiError { status: 404, message } => StoreError::NotFound(message),
            ClientError::ApiError { status: 409, message } => StoreError::Conflict(message),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
