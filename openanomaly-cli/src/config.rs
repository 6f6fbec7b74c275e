//! Configuration module
//!
//! Handles CLI configuration including the scheduler URL.

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of any scheduler instance
    pub scheduler_url: String,
}
