//! Configuration for the state-machine manager
//!
//! Values come from serde defaults and can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// State-machine manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineConfig {
    /// How long a flow may wait for a session reply before failing
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// How often the manager looks for timed-out sessions
    #[serde(default = "default_timeout_sweep_interval_ms")]
    pub timeout_sweep_interval_ms: u64,

    /// Upper bound on messages buffered per session before the sender is refused
    #[serde(default = "default_max_buffered_messages")]
    pub max_buffered_messages: usize,

    /// Capacity of the flow status broadcast channel
    #[serde(default = "default_changes_capacity")]
    pub changes_capacity: usize,
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_timeout_sweep_interval_ms() -> u64 {
    1_000
}

fn default_max_buffered_messages() -> usize {
    1_024
}

fn default_changes_capacity() -> usize {
    256
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            timeout_sweep_interval_ms: default_timeout_sweep_interval_ms(),
            max_buffered_messages: default_max_buffered_messages(),
            changes_capacity: default_changes_capacity(),
        }
    }
}

impl StateMachineConfig {
    /// Load configuration from defaults overridden by environment variables
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Ok(timeout) = env::var("ACCORD_SESSION_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => config.session_timeout_ms = ms,
                Err(_) => warn!("Invalid ACCORD_SESSION_TIMEOUT_MS value: {}", timeout),
            }
        }

        if let Ok(interval) = env::var("ACCORD_TIMEOUT_SWEEP_INTERVAL_MS") {
            match interval.parse::<u64>() {
                Ok(ms) => config.timeout_sweep_interval_ms = ms,
                Err(_) => warn!("Invalid ACCORD_TIMEOUT_SWEEP_INTERVAL_MS value: {}", interval),
            }
        }

        if let Ok(max) = env::var("ACCORD_MAX_BUFFERED_MESSAGES") {
            match max.parse::<usize>() {
                Ok(n) => config.max_buffered_messages = n,
                Err(_) => warn!("Invalid ACCORD_MAX_BUFFERED_MESSAGES value: {}", max),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the manager cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.timeout_sweep_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "Timeout sweep interval must be greater than zero".to_string(),
            ));
        }
        if self.max_buffered_messages == 0 {
            return Err(CoreError::ConfigurationError(
                "At least one buffered message per session is required".to_string(),
            ));
        }
        if self.changes_capacity == 0 {
            return Err(CoreError::ConfigurationError(
                "Changes channel capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Session timeout as a duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Timeout sweep interval as a duration
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    /// Builder-style override of the session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
