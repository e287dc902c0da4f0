//! Restart policy for a lost queue worker

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff applied by the supervisor before starting a fresh worker after
/// the previous one panicked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    /// Maximum number of restarts; `None` restarts forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    /// Delay before the first restart
    #[serde(with = "crate::config::duration_serde")]
    pub initial_delay: Duration,
    /// Upper bound on the delay between restarts
    #[serde(with = "crate::config::duration_serde")]
    pub max_delay: Duration,
    /// Growth factor applied per consecutive restart
    pub multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RestartPolicy {
    /// Unlimited restarts with exponential backoff from 10ms up to 5s
    pub fn exponential() -> Self {
        Self {
            max_restarts: None,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    /// Restart immediately, at most `max_restarts` times
    pub fn immediate(max_restarts: u32) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Never restart; a lost worker leaves the queue lost
    pub fn never() -> Self {
        Self::immediate(0)
    }

    /// Limit the number of restarts (builder pattern)
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = Some(max_restarts);
        self
    }

    /// Delay before restart number `restart` (1-based)
    pub fn delay_for_restart(&self, restart: u32) -> Duration {
        if restart == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(restart.saturating_sub(1) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Whether restart number `restart` (1-based) is allowed
    pub fn allows(&self, restart: u32) -> bool {
        match self.max_restarts {
            Some(max) => restart <= max,
            None => true,
        }
    }
}
