//! The notification record and its transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{InboundEvent, NotificationType};
use super::state::NotificationStatus;
use crate::Result;
use crate::database::time::{ms_to_datetime, now_ms};

/// Current time truncated to the millisecond precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    ms_to_datetime(now_ms())
}

/// The part of a record a writer must observe unchanged for its update to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusGuard {
    pub status: NotificationStatus,
    pub retry_count: u32,
}

/// One attempt to deliver one message to one user over one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    /// Producer event id; `(event_id, channel)` is the idempotency key.
    pub event_id: String,
    pub service_origin: String,
    pub user_id: i64,
    pub notification_type: NotificationType,
    /// Upper-case channel name (`EMAIL`, `PUSH`, `SMS`, ...).
    pub channel: String,
    pub title: String,
    pub content: String,
    pub recipient_address: String,
    pub status: NotificationStatus,
    pub retry_count: u32,
    /// Reason for the most recent failure or cancellation.
    pub last_error: Option<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Create a PENDING record for one channel of an inbound event.
    pub fn from_event(event: &InboundEvent, channel: &str) -> Self {
        let now = now();
        let channel = super::channels::normalize_channel(channel);
        Self {
            id: Uuid::new_v4(),
            event_id: event.event_id.clone(),
            service_origin: event.origin().to_string(),
            user_id: event.user_id,
            notification_type: event.notification_type,
            recipient_address: event.recipient_for(&channel).unwrap_or_default().to_string(),
            channel,
            title: event.title.clone(),
            content: event.content.clone(),
            status: NotificationStatus::Pending,
            retry_count: 0,
            last_error: None,
            read_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn guard(&self) -> StatusGuard {
        StatusGuard {
            status: self.status,
            retry_count: self.retry_count,
        }
    }

    pub fn is_terminal(&self, max_retries: u32) -> bool {
        self.status.is_terminal(self.retry_count, max_retries)
    }

    /// FAILED with no attempts left.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == NotificationStatus::Failed && self.retry_count >= max_retries
    }

    /// Still blocks a second record for the same idempotency key.
    pub fn is_live(&self, max_retries: u32) -> bool {
        self.status.is_success() || !self.is_terminal(max_retries)
    }

    fn transition(&mut self, target: NotificationStatus, max_retries: u32) -> Result<()> {
        self.status
            .check_transition(target, self.retry_count, max_retries)?;
        self.status = target;
        self.updated_at = now();
        Ok(())
    }

    /// PENDING -> SENT.
    pub fn mark_sent(&mut self, max_retries: u32) -> Result<()> {
        self.transition(NotificationStatus::Sent, max_retries)?;
        self.last_error = None;
        Ok(())
    }

    /// PENDING -> FAILED, consuming one attempt.
    pub fn mark_failed(&mut self, reason: impl Into<String>, max_retries: u32) -> Result<()> {
        self.transition(NotificationStatus::Failed, max_retries)?;
        self.retry_count = self.retry_count.saturating_add(1).min(max_retries);
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// FAILED (under the cap) -> PENDING.
    pub fn requeue(&mut self, max_retries: u32) -> Result<()> {
        self.transition(NotificationStatus::Pending, max_retries)
    }

    /// SENT -> DELIVERED.
    pub fn mark_delivered(&mut self, max_retries: u32) -> Result<()> {
        self.transition(NotificationStatus::Delivered, max_retries)
    }

    /// DELIVERED -> READ.
    pub fn mark_read(&mut self, max_retries: u32) -> Result<()> {
        self.transition(NotificationStatus::Read, max_retries)?;
        self.read_at = Some(self.updated_at);
        Ok(())
    }

    /// Any non-terminal state -> CANCELLED.
    pub fn cancel(&mut self, reason: impl Into<String>, max_retries: u32) -> Result<()> {
        self.transition(NotificationStatus::Cancelled, max_retries)?;
        self.last_error = Some(reason.into());
        Ok(())
    }
}
