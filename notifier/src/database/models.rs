//! Database models.
//!
//! Row types mapping directly to the schema, with conversions to the domain
//! types. Timestamps are epoch milliseconds, JSON columns are stored as text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::notification::{
    Notification, NotificationStatus, NotificationType, UserNotificationSettings,
};
use crate::{Error, Result};

/// Notification row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub event_id: String,
    pub service_origin: String,
    pub user_id: i64,
    /// Canonical type name (`TASK_ASSIGNED`, ...)
    pub notification_type: String,
    pub channel: String,
    pub title: String,
    pub content: String,
    pub recipient_address: String,
    /// PENDING, SENT, DELIVERED, READ, FAILED, CANCELLED
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub read_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Notification> for NotificationDbModel {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id.to_string(),
            event_id: n.event_id.clone(),
            service_origin: n.service_origin.clone(),
            user_id: n.user_id,
            notification_type: n.notification_type.as_str().to_string(),
            channel: n.channel.clone(),
            title: n.title.clone(),
            content: n.content.clone(),
            recipient_address: n.recipient_address.clone(),
            status: n.status.as_str().to_string(),
            retry_count: i64::from(n.retry_count),
            last_error: n.last_error.clone(),
            read_at: opt_datetime_to_ms(n.read_at),
            created_at: datetime_to_ms(n.created_at),
            updated_at: datetime_to_ms(n.updated_at),
        }
    }
}

impl TryFrom<NotificationDbModel> for Notification {
    type Error = Error;

    fn try_from(row: NotificationDbModel) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Database(format!("invalid notification id {}: {}", row.id, e)))?;
        let notification_type = NotificationType::parse(&row.notification_type).ok_or_else(|| {
            Error::Database(format!(
                "unknown notification type {} on {}",
                row.notification_type, row.id
            ))
        })?;
        let status = NotificationStatus::parse(&row.status).ok_or_else(|| {
            Error::Database(format!("unknown status {} on {}", row.status, row.id))
        })?;
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            Error::Database(format!("retry_count out of range on {}", row.id))
        })?;

        Ok(Self {
            id,
            event_id: row.event_id,
            service_origin: row.service_origin,
            user_id: row.user_id,
            notification_type,
            channel: row.channel,
            title: row.title,
            content: row.content,
            recipient_address: row.recipient_address,
            status,
            retry_count,
            last_error: row.last_error,
            read_at: opt_ms_to_datetime(row.read_at),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        })
    }
}

/// User settings row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserNotificationSettingsDbModel {
    pub user_id: i64,
    /// JSON object: channel name -> bool
    pub channels: String,
    /// JSON object: notification type -> bool
    pub types: String,
    pub updated_at: i64,
}

impl UserNotificationSettingsDbModel {
    pub fn from_settings(settings: &UserNotificationSettings, updated_at: i64) -> Result<Self> {
        Ok(Self {
            user_id: settings.user_id,
            channels: serde_json::to_string(&settings.channels)?,
            types: serde_json::to_string(&settings.types)?,
            updated_at,
        })
    }

    /// Decode the JSON columns. Type keys accept any known alias
    /// (`taskCreated`, `systemAlerts`, ...); unknown keys are skipped.
    pub fn into_settings(self) -> Result<UserNotificationSettings> {
        let raw_channels: BTreeMap<String, bool> = serde_json::from_str(&self.channels)?;
        let raw_types: BTreeMap<String, bool> = serde_json::from_str(&self.types)?;

        let mut settings = UserNotificationSettings::new(self.user_id);
        for (channel, enabled) in raw_channels {
            settings = settings.with_channel(&channel, enabled);
        }
        for (key, enabled) in raw_types {
            match NotificationType::parse(&key) {
                Some(ty) => settings = settings.with_type(ty, enabled),
                None => debug!(user_id = self.user_id, "Ignoring unknown type flag {}", key),
            }
        }
        Ok(settings)
    }
}
