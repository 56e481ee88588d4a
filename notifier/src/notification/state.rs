//! Delivery state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Delivery status of one notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Created, not yet attempted (or requeued for another attempt).
    #[default]
    Pending,
    /// The provider accepted the message.
    Sent,
    /// The channel confirmed delivery.
    Delivered,
    /// The recipient read the message.
    Read,
    /// The last attempt failed. Terminal once the retry cap is reached.
    Failed,
    /// Withdrawn by an operator or because the channel is unsupported.
    Cancelled,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 6] = [
        Self::Pending,
        Self::Sent,
        Self::Delivered,
        Self::Read,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "DELIVERED" => Some(Self::Delivered),
            "READ" => Some(Self::Read),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The provider accepted the message at some point.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    /// Whether the record is terminal given its retry counter.
    pub fn is_terminal(&self, retry_count: u32, max_retries: u32) -> bool {
        match self {
            Self::Read | Self::Cancelled => true,
            Self::Failed => retry_count >= max_retries,
            _ => false,
        }
    }

    /// Counts as unread for the recipient.
    pub fn is_unread(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }

    /// Validate the edge, ignoring the retry cap (see [`Self::check_transition`]).
    pub fn can_transition_to(&self, target: NotificationStatus) -> bool {
        use NotificationStatus::*;

        match (self, target) {
            (Pending, Sent | Failed | Cancelled) => true,
            (Sent, Delivered | Cancelled) => true,
            (Delivered, Read | Cancelled) => true,
            (Failed, Pending | Cancelled) => true,
            _ => false,
        }
    }

    /// Validate a transition including the retry cap on FAILED records.
    pub fn check_transition(
        &self,
        target: NotificationStatus,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<NotificationStatus, Error> {
        if self.is_terminal(retry_count, max_retries) || !self.can_transition_to(target) {
            return Err(Error::invalid_transition(self, target));
        }
        Ok(target)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
