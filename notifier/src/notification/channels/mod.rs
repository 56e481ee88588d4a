//! Channel providers.
//!
//! Each provider wraps one external transport:
//! - Email
//! - Push (device tokens)
//! - SMS

mod email;
mod push;
mod sms;
mod transport;

pub use email::{EmailChannel, EmailConfig};
pub use push::{PushChannel, PushConfig};
pub use sms::{SmsChannel, SmsConfig};
pub use transport::{FnTransport, LoggingTransport, Transport};

use async_trait::async_trait;

use super::model::Notification;

pub const EMAIL: &str = "EMAIL";
pub const PUSH: &str = "PUSH";
pub const SMS: &str = "SMS";

/// Canonical form of a channel name: trimmed and upper-case.
pub fn normalize_channel(channel: &str) -> String {
    channel.trim().to_ascii_uppercase()
}

/// A provider for one delivery channel.
///
/// Implementations must tolerate concurrent `send_notification` calls.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Stable channel name matching `Notification::channel`.
    fn channel(&self) -> &str;

    /// Operational kill-switch.
    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Make one delivery attempt. `true` means the transport accepted the message.
    async fn send_notification(&self, notification: &Notification) -> bool;
}
