//! Email channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChannelProvider, EMAIL, LoggingTransport, Transport};
use crate::notification::model::Notification;

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Whether the channel starts enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Prefix added to every subject line.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_subject_prefix() -> String {
    "[notifier]".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Email notification channel.
pub struct EmailChannel {
    config: EmailConfig,
    enabled: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            transport,
        }
    }

    /// Email channel that logs instead of sending.
    pub fn logging(config: EmailConfig) -> Self {
        Self::new(config, Arc::new(LoggingTransport::new("smtp")))
    }

    fn build_subject(&self, notification: &Notification) -> String {
        if self.config.subject_prefix.is_empty() {
            notification.title.clone()
        } else {
            format!("{} {}", self.config.subject_prefix, notification.title)
        }
    }

    /// Minimal shape check: `local@domain.tld`, no whitespace.
    fn is_valid_address(address: &str) -> bool {
        if address.chars().any(char::is_whitespace) {
            return false;
        }
        match address.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
            }
            None => false,
        }
    }
}

#[async_trait]
impl ChannelProvider for EmailChannel {
    fn channel(&self) -> &str {
        EMAIL
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

        let address = notification.recipient_address.trim();
        if !Self::is_valid_address(address) {
            warn!(
                notification_id = %notification.id,
                "Invalid email address {:?}, not sending",
                address
            );
            return false;
        }

        let subject = self.build_subject(notification);
        let accepted = self
            .transport
            .send(address, &subject, &notification.content)
            .await;

        debug!(
            notification_id = %notification.id,
            accepted,
            "Email attempt finished"
        );
        accepted
    }
}
