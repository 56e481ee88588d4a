//! Per-user channel filtering.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::channels::normalize_channel;
use super::events::NotificationType;
use crate::database::repositories::PreferenceStore;

/// A user's channel and type switches.
///
/// Absent keys mean enabled, so saving one switch never silences a channel or
/// type the user did not touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotificationSettings {
    pub user_id: i64,
    /// Upper-case channel name -> enabled.
    #[serde(default)]
    pub channels: BTreeMap<String, bool>,
    #[serde(default)]
    pub types: BTreeMap<NotificationType, bool>,
}

impl UserNotificationSettings {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn with_channel(mut self, channel: &str, enabled: bool) -> Self {
        self.channels.insert(normalize_channel(channel), enabled);
        self
    }

    pub fn with_type(mut self, notification_type: NotificationType, enabled: bool) -> Self {
        self.types.insert(notification_type, enabled);
        self
    }

    pub fn channel_enabled(&self, channel: &str) -> bool {
        self.channels
            .get(&normalize_channel(channel))
            .copied()
            .unwrap_or(true)
    }

    pub fn type_enabled(&self, notification_type: NotificationType) -> bool {
        self.types
            .get(&notification_type)
            .copied()
            .unwrap_or(true)
    }
}

/// Decides which candidate channels may fire for a user.
pub struct PreferenceFilter {
    store: Arc<dyn PreferenceStore>,
}

impl PreferenceFilter {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// Candidates the user allows for this type, deduplicated in input order.
    ///
    /// No settings record allows every candidate. A store error is logged and
    /// treated the same way.
    pub async fn allowed_channels(
        &self,
        user_id: i64,
        notification_type: NotificationType,
        candidates: &[String],
    ) -> Vec<String> {
        let mut channels: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let channel = normalize_channel(candidate);
            if !channel.is_empty() && !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        let settings = match self.store.get_settings(user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    user_id,
                    "Preference lookup failed, using defaults (degraded mode): {}", e
                );
                None
            }
        };

        let Some(settings) = settings else {
            return channels;
        };

        if !settings.type_enabled(notification_type) {
            debug!(user_id, %notification_type, "Notification type disabled by user");
            return Vec::new();
        }

        channels.retain(|c| settings.channel_enabled(c));
        channels
    }
}
