//! Logging and metrics for Accord nodes.
//!
//! [`init_logging`] installs the process-wide `tracing` subscriber and
//! [`MetricsEventHandler`] turns the engine's domain events into `metrics`
//! counters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

pub mod logging;
pub mod metrics;

pub use crate::logging::init_logging;
pub use crate::metrics::{FlowMetrics, MetricsEventHandler};

/// Configuration for initializing logging and metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to log output
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g., "info,accord_core=debug")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Emit JSON lines instead of human-readable logs
    #[serde(default)]
    pub enable_json_logging: bool,
}

fn default_service_name() -> String {
    "accord".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `ACCORD_LOG` and `ACCORD_LOG_JSON`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(filter) = lookup("ACCORD_LOG") {
            config.log_filter = filter;
        }

        if let Some(json) = lookup("ACCORD_LOG_JSON") {
            match json.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.enable_json_logging = true,
                "0" | "false" | "no" => config.enable_json_logging = false,
                _ => warn!("Invalid ACCORD_LOG_JSON value: {}", json),
            }
        }

        config
    }
}
