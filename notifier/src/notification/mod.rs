//! Notification delivery.
//!
//! Inbound events fan out to one record per permitted channel. Each record
//! moves through a guarded state machine, failed deliveries are retried with
//! bounded exponential backoff, and records are never duplicated for the same
//! `(event_id, channel)` while a live one exists.
//!
//! # Example
//!
//! ```ignore
//! use notifier::config::EngineConfig;
//! use notifier::notification::{InboundEvent, NotificationEngine, NotificationType, ProviderRegistry};
//! use notifier::notification::channels::{EmailChannel, EmailConfig, EMAIL};
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! registry.register(Arc::new(EmailChannel::logging(EmailConfig::default())));
//!
//! let engine = NotificationEngine::new(EngineConfig::default(), registry, repository, preferences)?;
//! engine.start()?;
//! engine
//!     .publish(
//!         "task",
//!         InboundEvent::new(NotificationType::TaskAssigned, 42, "Task assigned", "Review PR")
//!             .with_recipient(EMAIL, "dev@example.com"),
//!     )
//!     .await?;
//! ```

pub mod bus;
pub mod channels;
pub mod dispatcher;
pub mod events;
pub mod model;
pub mod preferences;
pub mod registry;
pub mod retry_policy;
pub mod scheduler;
pub mod service;
pub mod state;

pub use bus::EventBus;
pub use dispatcher::{DispatchOutcome, DispatchResult, Dispatcher};
pub use events::{InboundEvent, NotificationType, SYSTEM_ORIGIN};
pub use model::{Notification, StatusGuard};
pub use preferences::{PreferenceFilter, UserNotificationSettings};
pub use registry::ProviderRegistry;
pub use retry_policy::RetryPolicy;
pub use scheduler::{RetryScheduler, ScanReport};
pub use service::{ChannelState, NotificationEngine, NotificationStats};
pub use state::NotificationStatus;
