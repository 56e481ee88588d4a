//! Push channel (device tokens).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChannelProvider, LoggingTransport, PUSH, Transport};
use crate::notification::model::Notification;

/// Push channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Push payloads are truncated to this many characters.
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_body_chars() -> usize {
    1024
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_body_chars: default_max_body_chars(),
        }
    }
}

pub struct PushChannel {
    config: PushConfig,
    enabled: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl PushChannel {
    pub fn new(config: PushConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            transport,
        }
    }

    pub fn logging(config: PushConfig) -> Self {
        Self::new(config, Arc::new(LoggingTransport::new("push-gateway")))
    }

    fn build_body(&self, content: &str) -> String {
        content.chars().take(self.config.max_body_chars).collect()
    }
}

#[async_trait]
impl ChannelProvider for PushChannel {
    fn channel(&self) -> &str {
        PUSH
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

        let token = notification.recipient_address.trim();
        if token.is_empty() {
            warn!(notification_id = %notification.id, "Missing device token, not sending");
            return false;
        }

        let body = self.build_body(&notification.content);
        let accepted = self.transport.send(token, &notification.title, &body).await;

        debug!(notification_id = %notification.id, accepted, "Push attempt finished");
        accepted
    }
}
