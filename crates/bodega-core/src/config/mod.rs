//! Engine configuration.
//!
//! One struct carries every tunable the engine needs: remote endpoint,
//! owner identity, poll and admission windows, backoff, and plan limits.
//! Values usually come from a JSON file shipped with the client, so the
//! struct is serde-friendly and validated before use.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::UsageLimits;
use crate::notify::TriggerOptions;
use crate::sync::BackoffPolicy;
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_ADMISSION_WINDOW_SECS: u64 = 60;
const DEFAULT_USAGE_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_USAGE_ALERT_DELTA: f64 = 5.0;

/// Runtime configuration for the sync and notification engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Remote document-store endpoint; `None` runs fully offline
    #[serde(default)]
    pub remote_endpoint: Option<String>,
    /// Business account id
    pub owner_id: String,
    /// HTTP subscription poll interval, seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Trailing admission window for notifications, seconds
    #[serde(default = "default_admission_window_secs")]
    pub admission_window_secs: u64,
    /// Interval between local usage polls, seconds
    #[serde(default = "default_usage_poll_interval_secs")]
    pub usage_poll_interval_secs: u64,
    /// Percentage-point movement required for a usage re-alert
    #[serde(default = "default_usage_alert_delta")]
    pub usage_alert_delta: f64,
    /// Push retry backoff
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Plan limits used to derive usage percentages
    #[serde(default)]
    pub limits: UsageLimits,
}

const fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

const fn default_admission_window_secs() -> u64 {
    DEFAULT_ADMISSION_WINDOW_SECS
}

const fn default_usage_poll_interval_secs() -> u64 {
    DEFAULT_USAGE_POLL_INTERVAL_SECS
}

const fn default_usage_alert_delta() -> f64 {
    DEFAULT_USAGE_ALERT_DELTA
}

impl EngineConfig {
    /// Create a config for the given owner with every default applied
    #[must_use]
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            remote_endpoint: None,
            owner_id: owner_id.into(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            admission_window_secs: DEFAULT_ADMISSION_WINDOW_SECS,
            usage_poll_interval_secs: DEFAULT_USAGE_POLL_INTERVAL_SECS,
            usage_alert_delta: DEFAULT_USAGE_ALERT_DELTA,
            backoff: BackoffPolicy::default(),
            limits: UsageLimits::default(),
        }
    }

    /// Validate field values, normalizing the endpoint in place
    pub fn validate(&mut self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::Validation("owner_id must not be empty".to_string()));
        }
        self.owner_id = self.owner_id.trim().to_string();

        self.remote_endpoint = match normalize_text_option(self.remote_endpoint.take()) {
            Some(endpoint) if is_http_url(&endpoint) => {
                Some(endpoint.trim_end_matches('/').to_string())
            }
            Some(endpoint) => {
                return Err(Error::Validation(format!(
                    "remote_endpoint '{endpoint}' must include http:// or https://"
                )));
            }
            None => None,
        };

        if self.poll_interval_secs == 0 {
            return Err(Error::Validation(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.usage_poll_interval_secs == 0 {
            return Err(Error::Validation(
                "usage_poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.usage_alert_delta <= 0.0 {
            return Err(Error::Validation(
                "usage_alert_delta must be positive".to_string(),
            ));
        }
        if self.backoff.max_attempts == 0 {
            return Err(Error::Validation(
                "backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a config from a JSON payload
    pub fn from_json(payload: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    /// Notification trigger options derived from this config
    #[must_use]
    pub fn trigger_options(&self) -> TriggerOptions {
        TriggerOptions {
            admission_window: Duration::from_secs(self.admission_window_secs),
            usage_poll_interval: Duration::from_secs(self.usage_poll_interval_secs),
            usage_alert_delta: self.usage_alert_delta,
            limits: self.limits,
        }
    }

    /// HTTP subscription poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
