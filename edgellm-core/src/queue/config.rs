//! Configuration for the queue manager.

use std::time::Duration;

/// Configuration for the queue manager
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of jobs waiting behind the running one
    pub max_queue_length: usize,

    /// Longest a single job may run (model switch included) before it is
    /// failed as timed out
    pub job_timeout: Duration,

    /// Period of the background stale-job sweep
    pub cleanup_interval: Duration,

    /// Buffer of the queue event broadcast channel.
    /// Slow receivers lag past this many events.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 100,
            job_timeout: Duration::from_secs(300), // 5 minutes
            cleanup_interval: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Create config for a single interactive user: short queue, fail fast
    pub fn interactive() -> Self {
        Self {
            max_queue_length: 10,
            job_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(30),
            event_capacity: 64,
        }
    }

    /// Create config for large local models where loading alone takes minutes
    pub fn large_models() -> Self {
        Self {
            max_queue_length: 50,
            job_timeout: Duration::from_secs(1800), // 30 minutes
            cleanup_interval: Duration::from_secs(120),
            event_capacity: 256,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EDGELLM_MAX_QUEUE") {
            if let Ok(n) = val.parse() {
                config.max_queue_length = n;
            }
        }

        if let Ok(val) = std::env::var("EDGELLM_JOB_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                config.job_timeout = Duration::from_secs(n);
            }
        }

        if let Ok(val) = std::env::var("EDGELLM_CLEANUP_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.cleanup_interval = Duration::from_secs(n);
            }
        }

        if let Ok(val) = std::env::var("EDGELLM_EVENT_CAPACITY") {
            if let Ok(n) = val.parse::<usize>() {
                config.event_capacity = n.max(1);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_queue_length, 100);
        assert_eq!(config.job_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_presets() {
        assert_eq!(QueueConfig::interactive().max_queue_length, 10);
        assert!(QueueConfig::large_models().job_timeout > QueueConfig::default().job_timeout);
    }
}
