//! SMS channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChannelProvider, LoggingTransport, SMS, Transport};
use crate::notification::model::Notification;

/// SMS channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Messages longer than this are cut and suffixed with an ellipsis.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_length() -> usize {
    160
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: default_max_length(),
        }
    }
}

pub struct SmsChannel {
    config: SmsConfig,
    enabled: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl SmsChannel {
    pub fn new(config: SmsConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            transport,
        }
    }

    pub fn logging(config: SmsConfig) -> Self {
        Self::new(config, Arc::new(LoggingTransport::new("sms-gateway")))
    }

    /// E.164-like: optional leading `+`, then 7 to 15 digits. Spaces and dashes are ignored.
    fn normalize_number(raw: &str) -> Option<String> {
        let raw = raw.trim();
        let (plus, digits) = match raw.strip_prefix('+') {
            Some(rest) => ("+", rest),
            None => ("", raw),
        };

        let mut out = String::with_capacity(raw.len());
        out.push_str(plus);
        let mut count = 0;
        for c in digits.chars() {
            match c {
                '0'..='9' => {
                    out.push(c);
                    count += 1;
                }
                ' ' | '-' => {}
                _ => return None,
            }
        }

        (7..=15).contains(&count).then_some(out)
    }

    fn build_text(&self, notification: &Notification) -> String {
        let text = format!("{}: {}", notification.title, notification.content);
        if text.chars().count() <= self.config.max_length {
            return text;
        }
        let keep = self.config.max_length.saturating_sub(3);
        let mut truncated: String = text.chars().take(keep).collect();
        truncated.push_str("...");
        truncated
    }
}

#[async_trait]
impl ChannelProvider for SmsChannel {
    fn channel(&self) -> &str {
        SMS
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    async fn send_notification(&self, notification: &Notification) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let Some(number) = Self::normalize_number(&notification.recipient_address) else {
            warn!(
                notification_id = %notification.id,
                "Invalid phone number {:?}, not sending",
                notification.recipient_address
            );
            return false;
        };

        let text = self.build_text(notification);
        let accepted = self.transport.send(&number, &notification.title, &text).await;

        debug!(notification_id = %notification.id, accepted, "SMS attempt finished");
        accepted
    }
}
