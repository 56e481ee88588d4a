//! Notification events.
//!
//! Defines the notification types known to the engine and the inbound event
//! payload published by the task, user and audit services.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::channels::normalize_channel;
use crate::{Error, Result};

/// Origin label assigned to events that arrive without one.
pub const SYSTEM_ORIGIN: &str = "system";

/// Kind of domain event a notification is about.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskAssigned,
    TaskCompleted,
    TaskOverdue,
    UserRegistered,
    UserLogin,
    SystemAlert,
    Reminder,
}

/// Accepted spellings for a notification type besides its canonical name.
struct NotificationTypeInfo {
    notification_type: NotificationType,
    /// Legacy and producer-specific aliases.
    aliases: &'static [&'static str],
}

const NOTIFICATION_TYPES: &[NotificationTypeInfo] = &[
    NotificationTypeInfo {
        notification_type: NotificationType::TaskCreated,
        aliases: &["task_created", "task.created", "TaskCreated", "taskCreated"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::TaskUpdated,
        aliases: &["task_updated", "task.updated", "TaskUpdated", "taskUpdated"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::TaskDeleted,
        aliases: &["task_deleted", "task.deleted", "TaskDeleted", "taskDeleted"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::TaskAssigned,
        aliases: &["task_assigned", "task.assigned", "TaskAssigned", "taskAssigned"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::TaskCompleted,
        aliases: &[
            "task_completed",
            "task.completed",
            "TaskCompleted",
            "taskCompleted",
        ],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::TaskOverdue,
        aliases: &["task_overdue", "task.overdue", "TaskOverdue", "taskOverdue"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::UserRegistered,
        aliases: &[
            "user_registered",
            "user.registered",
            "UserRegistered",
            "userRegistered",
        ],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::UserLogin,
        aliases: &["user_login", "user.login", "UserLogin", "userLogin"],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::SystemAlert,
        aliases: &[
            "system_alert",
            "system.alert",
            "SystemAlert",
            "systemAlert",
            "systemAlerts",
        ],
    },
    NotificationTypeInfo {
        notification_type: NotificationType::Reminder,
        aliases: &["reminder", "Reminder", "reminders"],
    },
];

impl NotificationType {
    /// Canonical wire representation (`TASK_CREATED`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskUpdated => "TASK_UPDATED",
            Self::TaskDeleted => "TASK_DELETED",
            Self::TaskAssigned => "TASK_ASSIGNED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskOverdue => "TASK_OVERDUE",
            Self::UserRegistered => "USER_REGISTERED",
            Self::UserLogin => "USER_LOGIN",
            Self::SystemAlert => "SYSTEM_ALERT",
            Self::Reminder => "REMINDER",
        }
    }

    /// Parse the canonical form or any known alias.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        NOTIFICATION_TYPES
            .iter()
            .find(|info| {
                info.notification_type.as_str().eq_ignore_ascii_case(value)
                    || info.aliases.iter().any(|alias| *alias == value)
            })
            .map(|info| info.notification_type)
    }
}

/// A domain event delivered to the engine over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Producer-assigned identifier; half of the idempotency key.
    pub event_id: String,
    /// Originating service label (`task`, `user`, `audit`, ...).
    #[serde(default)]
    pub service_origin: Option<String>,
    pub notification_type: NotificationType,
    pub user_id: i64,
    /// Channel name -> recipient address hints.
    #[serde(default)]
    pub recipients: BTreeMap<String, String>,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        notification_type: NotificationType,
        user_id: i64,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            service_origin: None,
            notification_type,
            user_id,
            recipients: BTreeMap::new(),
            title: title.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.service_origin = Some(origin.into());
        self
    }

    pub fn with_recipient(mut self, channel: &str, address: impl Into<String>) -> Self {
        self.recipients
            .insert(normalize_channel(channel), address.into());
        self
    }

    /// Origin label, defaulting to the system topic.
    pub fn origin(&self) -> &str {
        self.service_origin
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(SYSTEM_ORIGIN)
    }

    /// Channels this event can be delivered on, normalized and deduplicated.
    pub fn candidate_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = Vec::with_capacity(self.recipients.len());
        for channel in self.recipients.keys() {
            let channel = normalize_channel(channel);
            if !channel.is_empty() && !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        channels
    }

    /// Recipient address for a channel, matched case-insensitively.
    pub fn recipient_for(&self, channel: &str) -> Option<&str> {
        let wanted = normalize_channel(channel);
        self.recipients
            .iter()
            .find(|(k, _)| normalize_channel(k) == wanted)
            .map(|(_, v)| v.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_id.trim().is_empty() {
            return Err(Error::validation("event_id must not be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_type_has_metadata() {
        for ty in NotificationType::iter() {
            assert!(
                NOTIFICATION_TYPES.iter().any(|i| i.notification_type == ty),
                "missing metadata for {}",
                ty
            );
            assert_eq!(NotificationType::parse(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn parse_accepts_canonical_and_aliases() {
        assert_eq!(
            NotificationType::parse("TASK_ASSIGNED"),
            Some(NotificationType::TaskAssigned)
        );
        assert_eq!(
            NotificationType::parse("task.assigned"),
            Some(NotificationType::TaskAssigned)
        );
        assert_eq!(
            NotificationType::parse("systemAlerts"),
            Some(NotificationType::SystemAlert)
        );
        assert_eq!(NotificationType::parse("nope"), None);
        assert_eq!(NotificationType::parse("  "), None);
    }

    #[test]
    fn display_matches_wire_format() {
        for ty in NotificationType::iter() {
            assert_eq!(ty.to_string(), ty.as_str());
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn event_candidates_are_normalized() {
        let event = InboundEvent::new(NotificationType::TaskAssigned, 42, "t", "c")
            .with_recipient("email", "a@example.com")
            .with_recipient(" Push ", "token-1");

        assert_eq!(event.candidate_channels(), vec!["EMAIL", "PUSH"]);
        assert_eq!(event.recipient_for("Email"), Some("a@example.com"));
        assert_eq!(event.recipient_for("SMS"), None);
        assert_eq!(event.origin(), SYSTEM_ORIGIN);
    }

    #[test]
    fn validate_rejects_blank_title() {
        let event = InboundEvent::new(NotificationType::Reminder, 1, " ", "c");
        assert!(event.validate().is_err());
    }
}
