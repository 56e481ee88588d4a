//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notification::channels::{EmailConfig, PushConfig, SmsConfig};
use crate::notification::retry_policy::RetryPolicy;
use crate::{Error, Result};

/// Prefix for every environment variable read by [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "NOTIFIER_";

/// Provider settings, one block per built-in channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub sms: SmsConfig,
}

/// Configuration for the notification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When false, inbound events are drained without dispatching.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Backoff and retry cap for failed deliveries.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Seconds between retry scheduler passes.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Records read per scheduler page.
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: u32,
    /// Concurrent dispatch workers; also bounds concurrent retries per page.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Inbound event queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Deadline for a single provider send.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

fn default_true() -> bool {
    true
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_scan_page_size() -> u32 {
    100
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_policy: RetryPolicy::default(),
            scan_interval_secs: default_scan_interval_secs(),
            scan_page_size: default_scan_page_size(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            channels: ChannelsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn max_retries(&self) -> u32 {
        self.retry_policy.max_retries
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Defaults overridden by `NOTIFIER_*` environment variables.
    ///
    /// Supported env vars:
    /// - `NOTIFIER_ENABLED`
    /// - `NOTIFIER_MAX_RETRIES`
    /// - `NOTIFIER_RETRY_INITIAL_DELAY_MS`, `NOTIFIER_RETRY_MAX_DELAY_MS`
    /// - `NOTIFIER_RETRY_BACKOFF_MULTIPLIER`, `NOTIFIER_RETRY_JITTER`
    /// - `NOTIFIER_SCAN_INTERVAL_SECS`, `NOTIFIER_SCAN_PAGE_SIZE`
    /// - `NOTIFIER_WORKER_COUNT`, `NOTIFIER_QUEUE_CAPACITY`, `NOTIFIER_SEND_TIMEOUT_MS`
    /// - `NOTIFIER_EMAIL_ENABLED`, `NOTIFIER_PUSH_ENABLED`, `NOTIFIER_SMS_ENABLED`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<(String, String)> {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let mut config = Self::default();

        if let Some((key, v)) = get("ENABLED") {
            config.enabled = parse_bool(&key, &v)?;
        }
        if let Some((key, v)) = get("MAX_RETRIES") {
            config.retry_policy.max_retries = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("RETRY_INITIAL_DELAY_MS") {
            config.retry_policy.initial_delay_ms = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("RETRY_MAX_DELAY_MS") {
            config.retry_policy.max_delay_ms = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("RETRY_BACKOFF_MULTIPLIER") {
            config.retry_policy.backoff_multiplier = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("RETRY_JITTER") {
            config.retry_policy.use_jitter = parse_bool(&key, &v)?;
        }
        if let Some((key, v)) = get("SCAN_INTERVAL_SECS") {
            config.scan_interval_secs = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("SCAN_PAGE_SIZE") {
            config.scan_page_size = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("WORKER_COUNT") {
            config.worker_count = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("QUEUE_CAPACITY") {
            config.queue_capacity = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("SEND_TIMEOUT_MS") {
            config.send_timeout_ms = parse(&key, &v)?;
        }
        if let Some((key, v)) = get("EMAIL_ENABLED") {
            config.channels.email.enabled = parse_bool(&key, &v)?;
        }
        if let Some((key, v)) = get("PUSH_ENABLED") {
            config.channels.push.enabled = parse_bool(&key, &v)?;
        }
        if let Some((key, v)) = get("SMS_ENABLED") {
            config.channels.sms.enabled = parse_bool(&key, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry_policy.validate()?;
        if self.scan_interval_secs == 0 {
            return Err(Error::config("scan_interval_secs must be greater than 0"));
        }
        if self.scan_page_size == 0 {
            return Err(Error::config("scan_page_size must be greater than 0"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("worker_count must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be greater than 0"));
        }
        if self.send_timeout_ms == 0 {
            return Err(Error::config("send_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::config(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key}={value:?}: expected a boolean"))),
    }
}
