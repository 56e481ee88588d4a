//! Retry policy for failed deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Bounded exponential backoff keyed on a record's `retry_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts before a record is terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on the backoff in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Add up to 25% random delay on top of the computed backoff.
    #[serde(default)]
    pub use_jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    60_000
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Backoff floor for a record that has failed `retry_count` times.
    ///
    /// `initial_delay * multiplier^retry_count`, capped at `max_delay`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let delay_ms = if base_delay.is_finite() {
            base_delay.min(self.max_delay_ms as f64) as u64
        } else {
            self.max_delay_ms
        };

        if self.use_jitter {
            // Add up to 25% jitter
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    /// Smallest backoff any record can have; used to pre-filter scans.
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms))
    }

    /// Check if another attempt is allowed after `retry_count` failures.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Whether a FAILED record last touched at `updated_at` is past its backoff window.
    pub fn is_due(&self, retry_count: u32, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.should_retry(retry_count) {
            return false;
        }
        let elapsed = now.signed_duration_since(updated_at);
        let Ok(elapsed) = elapsed.to_std() else {
            return false;
        };
        elapsed >= self.backoff_for(retry_count)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::config("retry_policy.max_retries must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry_policy.backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::config(
                "retry_policy.max_delay_ms must not be lower than initial_delay_ms",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: false,
        }
    }
}
