use std::time::Duration;

use serde::Deserialize;

use crate::core::poll::PollError;
use crate::core::resilience::ExponentialBackoff;

pub const DEFAULT_REFRESH_SECONDS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_refresh_seconds")]
    pub refresh_seconds: u64,
}

fn default_refresh_seconds() -> u64 {
    DEFAULT_REFRESH_SECONDS
}

impl SourceConfig {
    pub fn new(url: impl Into<String>, refresh_seconds: Option<u64>) -> Self {
        Self {
            url: url.into(),
            refresh_seconds: refresh_seconds.unwrap_or(DEFAULT_REFRESH_SECONDS),
        }
    }

    pub fn validate(&self) -> Result<(), PollError> {
        if self.url.trim().is_empty() {
            return Err(PollError::Config {
                reason: "Parameter 'url' is mandatory and must be configured".to_string(),
            });
        }

        if self.refresh_seconds == 0 {
            return Err(PollError::Config {
                reason: "Parameter 'refresh_seconds' must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Delay between the end of one poll cycle and the start of the next.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }

    pub fn request_url(&self, path: &str) -> String {
        let base = self.url.trim();
        if base.ends_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Fetches per cycle, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}
