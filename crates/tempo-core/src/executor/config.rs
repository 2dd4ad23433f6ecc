//! Scheduler configuration.
//!
//! Keys are camelCase and millisecond based so existing engine configs can
//! be reused as is. Every field has a default; a config file only needs the
//! keys it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{LockOwner, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("corePoolSize ({core}) exceeds maxPoolSize ({max})")]
    PoolBounds { core: usize, max: usize },

    #[error("{0} must be a finite number >= 1.0")]
    Factor(&'static str),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Batches leased per acquisition round.
    pub max_jobs_per_acquisition: usize,

    /// Idle sleep after a round that leased less than a full batch.
    pub wait_time_in_millis: u64,

    /// Lease duration. Must exceed the worst-case job execution time.
    pub lock_time_in_millis: u64,

    /// Identity stamped on leased jobs.
    pub lock_owner: LockOwner,

    pub queue_size: usize,
    pub core_pool_size: usize,
    pub max_pool_size: usize,

    /// Idle time after which workers beyond `core_pool_size` exit.
    pub keep_alive_in_millis: u64,

    /// Start acquiring as soon as the scheduler is built.
    pub auto_activate: bool,

    /// How long `shutdown` waits for in-flight batches.
    pub shutdown_grace_in_millis: u64,

    /// Multiplier applied to the idle wait after each failed acquisition.
    pub wait_increase_factor: f64,

    /// Cap for the idle wait after failed acquisitions.
    pub max_wait_in_millis: u64,

    /// Delay before a failed job becomes acquirable again (0 = immediately).
    pub retry_base_delay_in_millis: u64,

    pub retry_multiplier: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_acquisition: 3,
            wait_time_in_millis: 5_000,
            lock_time_in_millis: 300_000,
            lock_owner: LockOwner::generate(),
            queue_size: 3,
            core_pool_size: 3,
            max_pool_size: 10,
            keep_alive_in_millis: 0,
            auto_activate: false,
            shutdown_grace_in_millis: 60_000,
            wait_increase_factor: 1.0,
            max_wait_in_millis: 60_000,
            retry_base_delay_in_millis: 0,
            retry_multiplier: 2.0,
        }
    }
}

impl SchedulerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("maxJobsPerAcquisition", self.max_jobs_per_acquisition as u64),
            ("lockTimeInMillis", self.lock_time_in_millis),
            ("queueSize", self.queue_size as u64),
            ("corePoolSize", self.core_pool_size as u64),
            ("maxPoolSize", self.max_pool_size as u64),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(field));
        }
        if self.core_pool_size > self.max_pool_size {
            return Err(ConfigError::PoolBounds {
                core: self.core_pool_size,
                max: self.max_pool_size,
            });
        }
        if !(self.wait_increase_factor.is_finite() && self.wait_increase_factor >= 1.0) {
            return Err(ConfigError::Factor("waitIncreaseFactor"));
        }
        if !(self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0) {
            return Err(ConfigError::Factor("retryMultiplier"));
        }
        Ok(())
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_in_millis)
    }

    pub fn lock_time(&self) -> Duration {
        Duration::from_millis(self.lock_time_in_millis)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_in_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_in_millis)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_in_millis.max(self.wait_time_in_millis))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_in_millis),
            self.retry_multiplier,
        )
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time_in_millis = millis(wait);
        self
    }

    pub fn with_lock_time(mut self, lock: Duration) -> Self {
        self.lock_time_in_millis = millis(lock);
        self
    }

    pub fn with_lock_owner(mut self, owner: LockOwner) -> Self {
        self.lock_owner = owner;
        self
    }

    pub fn with_pool(mut self, queue_size: usize, core_pool_size: usize, max_pool_size: usize) -> Self {
        self.queue_size = queue_size;
        self.core_pool_size = core_pool_size;
        self.max_pool_size = max_pool_size;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_in_millis = millis(keep_alive);
        self
    }

    pub fn with_auto_activate(mut self, auto_activate: bool) -> Self {
        self.auto_activate = auto_activate;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_in_millis = millis(grace);
        self
    }

    pub fn with_retry_backoff(mut self, base_delay: Duration, multiplier: f64) -> Self {
        self.retry_base_delay_in_millis = millis(base_delay);
        self.retry_multiplier = multiplier;
        self
    }

    pub fn with_wait_backoff(mut self, factor: f64, max_wait: Duration) -> Self {
        self.wait_increase_factor = factor;
        self.max_wait_in_millis = millis(max_wait);
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_the_engine() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_jobs_per_acquisition, 3);
        assert_eq!(config.wait_time(), Duration::from_secs(5));
        assert_eq!(config.lock_time(), Duration::from_secs(300));
        assert_eq!((config.queue_size, config.core_pool_size, config.max_pool_size), (3, 3, 10));
        assert!(!config.auto_activate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn each_instance_gets_its_own_lock_owner() {
        assert_ne!(
            SchedulerConfig::default().lock_owner,
            SchedulerConfig::default().lock_owner
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SchedulerConfig::from_json_str(
            r#"{ "maxJobsPerAcquisition": 7, "lockOwner": "node-1", "waitTimeInMillis": 250 }"#,
        )
        .unwrap();

        assert_eq!(config.max_jobs_per_acquisition, 7);
        assert_eq!(config.lock_owner, LockOwner::new("node-1"));
        assert_eq!(config.wait_time(), Duration::from_millis(250));
        assert_eq!(config.lock_time(), Duration::from_secs(300));
    }

    #[rstest]
    #[case(r#"{ "queueSize": 0 }"#, "queueSize")]
    #[case(r#"{ "maxJobsPerAcquisition": 0 }"#, "maxJobsPerAcquisition")]
    #[case(r#"{ "lockTimeInMillis": 0 }"#, "lockTimeInMillis")]
    fn zero_sizes_are_rejected(#[case] json: &str, #[case] field: &str) {
        let err = SchedulerConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::Zero(f) if f == field));
    }

    #[test]
    fn core_pool_cannot_exceed_max_pool() {
        let err = SchedulerConfig::from_json_str(r#"{ "corePoolSize": 11 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::PoolBounds { core: 11, max: 10 }));
    }

    #[test]
    fn shrinking_factors_are_rejected() {
        let config = SchedulerConfig::default().with_wait_backoff(0.5, Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(ConfigError::Factor("waitIncreaseFactor"))));
    }

    #[test]
    fn unknown_json_is_a_parse_error() {
        let err = SchedulerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
