//! OpenAnomaly HTTP clients
//!
//! - [`SchedulerClient`]: the scheduler API, used by workers (job queue,
//!   result ledger, artifacts) and by the CLI (pipelines, triggers, leadership)
//! - [`PrometheusClient`]: range reads and text-format writes against a
//!   Prometheus-compatible TSDB
//! - [`RemoteModelEngine`]: HTTP model servers speaking JSON or Arrow IPC
//!
//! # Example
//!
//! ```no_run
//! use openanomaly_client::SchedulerClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SchedulerClient::new("http://localhost:8080");
//!     for pipeline in client.list_pipelines().await? {
//!         println!("{} valid={}", pipeline.name, pipeline.valid);
//!     }
//!     Ok(())
//! }
//! ```

pub mod arrow_codec;
pub mod error;
mod jobs;
mod ledger;
mod pipelines;
pub mod prometheus;
pub mod remote;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use prometheus::PrometheusClient;
pub use remote::RemoteModelEngine;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the scheduler API
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    /// Base URL of the scheduler (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl SchedulerClient {
    /// Create a new scheduler client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the scheduler API (e.g., "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new scheduler client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the scheduler
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    ///
    /// This method checks the status code and returns an appropriate error if
    /// the request failed, or deserializes the response body if successful.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = SchedulerClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_client_with_custom_client() {
        let http_client = Client::new();
        let client = SchedulerClient::with_client("http://scheduler:8080", http_client);
        assert_eq!(client.base_url(), "http://scheduler:8080");
    }
}
