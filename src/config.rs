//! Change queue configuration types

use crate::error::{ChangeQueueError, Result};
use crate::restart::RestartPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on a single drain rendezvous
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Change queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeQueueConfig {
    /// Minimum spacing between drains; zero drains as fast as demand allows
    #[serde(default, with = "duration_serde")]
    pub write_interval: Duration,
    /// How long a drain waits for the worker's reply
    #[serde(default = "default_ask_timeout", with = "duration_serde")]
    pub ask_timeout: Duration,
    /// What to do when the worker is lost
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

fn default_ask_timeout() -> Duration {
    DEFAULT_ASK_TIMEOUT
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ChangeQueueConfig {
    fn default() -> Self {
        Self {
            write_interval: Duration::ZERO,
            ask_timeout: DEFAULT_ASK_TIMEOUT,
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl ChangeQueueConfig {
    /// Create a configuration throttled to one drain per `write_interval`
    pub fn new(write_interval: Duration) -> Self {
        Self {
            write_interval,
            ..Self::default()
        }
    }

    /// Set the write interval (builder pattern)
    pub fn with_write_interval(mut self, write_interval: Duration) -> Self {
        self.write_interval = write_interval;
        self
    }

    /// Set the drain ask timeout (builder pattern)
    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.ask_timeout = ask_timeout;
        self
    }

    /// Set the restart policy (builder pattern)
    pub fn with_restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    /// Whether drains are rate limited
    pub fn is_throttled(&self) -> bool {
        !self.write_interval.is_zero()
    }

    /// Reject configurations the queue cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ask_timeout.is_zero() {
            return Err(ChangeQueueError::Config(
                "ask_timeout must be greater than zero".to_string(),
            ));
        }
        if self.restart_policy.multiplier < 1.0 {
            return Err(ChangeQueueError::Config(format!(
                "restart multiplier must be at least 1.0, got {}",
                self.restart_policy.multiplier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ChangeQueueConfig::default();
        assert_eq!(config.write_interval, Duration::ZERO);
        assert_eq!(config.ask_timeout, Duration::from_secs(5));
        assert!(!config.is_throttled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_new_is_throttled() {
        let config = ChangeQueueConfig::new(Duration::from_millis(100));
        assert!(config.is_throttled());
        assert_eq!(config.ask_timeout, DEFAULT_ASK_TIMEOUT);
    }

    #[test]
    fn test_config_builders() {
        let config = ChangeQueueConfig::default()
            .with_write_interval(Duration::from_secs(1))
            .with_ask_timeout(Duration::from_millis(250))
            .with_restart_policy(RestartPolicy::never());
        assert_eq!(config.write_interval, Duration::from_secs(1));
        assert_eq!(config.ask_timeout, Duration::from_millis(250));
        assert_eq!(config.restart_policy, RestartPolicy::never());
    }

    #[test]
    fn test_zero_ask_timeout_rejected() {
        let config = ChangeQueueConfig::default().with_ask_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ChangeQueueError::Config(_))
        ));
    }

    #[test]
    fn test_shrinking_restart_multiplier_rejected() {
        let mut policy = RestartPolicy::exponential();
        policy.multiplier = 0.5;
        let config = ChangeQueueConfig::default().with_restart_policy(policy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = ChangeQueueConfig::new(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"write_interval\":1500"));
        assert!(json.contains("\"ask_timeout\":5000"));

        let parsed: ChangeQueueConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let parsed: ChangeQueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, ChangeQueueConfig::default());
    }
}
