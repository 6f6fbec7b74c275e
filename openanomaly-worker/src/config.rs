//! Worker configuration
//!
//! Defines all configurable parameters for the worker including polling,
//! concurrency, time budgets and the endpoints it talks to.

use std::time::Duration;

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Scheduler base URL (e.g., "http://localhost:8080")
    pub scheduler_url: String,

    /// Prometheus query API base URL
    pub prometheus_url: String,

    /// Text-format import endpoint results are written to
    pub prometheus_write_url: String,

    /// How often to poll the scheduler for visible jobs
    pub poll_interval: Duration,

    /// Max jobs executed concurrently
    pub max_parallel_jobs: usize,

    /// Wall-clock budget of one task execution
    pub task_timeout: Duration,

    /// Timeout of each individual HTTP call
    pub http_timeout: Duration,

    /// Extra attempts for a failed TSDB write, with exponential backoff
    pub write_retries: u32,

    /// Share of the expected context points required before predicting
    pub min_context_fraction: f64,

    /// Age after which another delivery's uncommitted result claim is taken over
    pub claim_stale_after: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, scheduler_url: String, prometheus_url: String) -> Self {
        let prometheus_write_url = default_write_url(&prometheus_url);
        Self {
            worker_id,
            scheduler_url,
            prometheus_url,
            prometheus_write_url,
            poll_interval: Duration::from_secs(2),
            max_parallel_jobs: 4,
            task_timeout: Duration::from_secs(90),
            http_timeout: Duration::from_secs(30),
            write_retries: 3,
            min_context_fraction: 0.5,
            claim_stale_after: Duration::from_secs(120),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (optional, default: random UUID)
    /// - SCHEDULER_URL (required)
    /// - PROMETHEUS_URL (required)
    /// - PROMETHEUS_WRITE_URL (optional, default: {PROMETHEUS_URL}/api/v1/import/prometheus)
    /// - POLL_INTERVAL (optional, seconds, default: 2)
    /// - MAX_PARALLEL_JOBS (optional, default: 4)
    /// - TASK_TIMEOUT (optional, seconds, default: 90)
    /// - HTTP_TIMEOUT (optional, seconds, default: 30)
    /// - WRITE_RETRIES (optional, default: 3)
    /// - MIN_CONTEXT_FRACTION (optional, default: 0.5)
    /// - CLAIM_STALE_AFTER (optional, seconds, default: 120)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let scheduler_url = std::env::var("SCHEDULER_URL")
            .map_err(|_| anyhow::anyhow!("SCHEDULER_URL environment variable not set"))?;

        let prometheus_url = std::env::var("PROMETHEUS_URL")
            .map_err(|_| anyhow::anyhow!("PROMETHEUS_URL environment variable not set"))?;

        let mut config = Self::new(worker_id, scheduler_url, prometheus_url);

        if let Ok(url) = std::env::var("PROMETHEUS_WRITE_URL") {
            config.prometheus_write_url = url;
        }
        if let Some(secs) = env_parse::<u64>("POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs = n;
        }
        if let Some(secs) = env_parse::<u64>("TASK_TIMEOUT") {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("HTTP_TIMEOUT") {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("WRITE_RETRIES") {
            config.write_retries = n;
        }
        if let Some(f) = env_parse::<f64>("MIN_CONTEXT_FRACTION") {
            config.min_context_fraction = f;
        }
        if let Some(secs) = env_parse::<u64>("CLAIM_STALE_AFTER") {
            config.claim_stale_after = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        for (name, url) in [
            ("scheduler_url", &self.scheduler_url),
            ("prometheus_url", &self.prometheus_url),
            ("prometheus_write_url", &self.prometheus_write_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{name} must start with http:// or https://");
            }
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        if self.http_timeout.is_zero() || self.task_timeout < self.http_timeout {
            anyhow::bail!("task_timeout must be at least http_timeout, and both positive");
        }

        if !(0.0..=1.0).contains(&self.min_context_fraction) {
            anyhow::bail!("min_context_fraction must be within [0, 1]");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
            "http://localhost:9090".to_string(),
        )
    }
}

fn default_write_url(prometheus_url: &str) -> String {
    format!(
        "{}/api/v1/import/prometheus",
        prometheus_url.trim_end_matches('/')
    )
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_parallel_jobs, 4);
        assert_eq!(
            config.prometheus_write_url,
            "http://localhost:9090/api/v1/import/prometheus"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.scheduler_url = "scheduler:8080".to_string();
        assert!(config.validate().is_err());
        config.scheduler_url = "http://scheduler:8080".to_string();

        config.max_parallel_jobs = 0;
        assert!(config.validate().is_err());
        config.max_parallel_jobs = 1;

        config.min_context_fraction = 1.5;
        assert!(config.validate().is_err());
        config.min_context_fraction = 0.5;

        config.task_timeout = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_url_ignores_trailing_slash() {
        let config = Config::new(
            "w".into(),
            "http://s:8080".into(),
            "http://vm:8428/".into(),
        );
        assert_eq!(config.prometheus_write_url, "http://vm:8428/api/v1/import/prometheus");
    }
}
